//! Bootstrap authentication: bounded retries on fresh sessions, pinned-key
//! enforcement on reconnect, and exhaustion reporting.

use std::sync::Arc;
use std::time::Duration;

use gatehouse::bootstrap::{BackoffPolicy, BootstrapConfig, NodeBootstrap};
use gatehouse::error::BootstrapError;
use gatehouse::quarantine::QuarantineList;
use gatehouse::trust::VerificationStrategy;

use crate::fixtures::{
    ConnectStep, FakeInstance, ScriptedTransport, memory_key_store, test_credential, test_key,
};

const NODE: &str = "i-auth";

fn config(auth_tries: u32) -> BootstrapConfig {
    BootstrapConfig {
        launch_timeout: Some(Duration::from_secs(600)),
        connect_timeout: Duration::from_secs(10),
        retry: BackoffPolicy::fixed(Duration::from_secs(5)),
        auth_tries,
        auth_retry_interval: Duration::from_secs(5),
    }
}

fn bootstrap(
    transport: Arc<ScriptedTransport>,
    auth_tries: u32,
) -> NodeBootstrap {
    NodeBootstrap::new(
        NODE,
        22,
        "admin",
        test_credential(),
        VerificationStrategy::AcceptNew,
        FakeInstance::running(NODE).shared(),
        transport,
        memory_key_store(),
        Arc::new(QuarantineList::new()),
    )
    .with_config(config(auth_tries))
}

#[tokio::test(start_paused = true)]
async fn failed_auth_retries_on_a_fresh_session() {
    let key = test_key(&[1]);
    let transport = ScriptedTransport::new(vec![
        ConnectStep::present_auth_failing(&key),
        ConnectStep::present(&key),
    ]);

    let session = bootstrap(transport.clone(), 3)
        .run()
        .await
        .expect("second session must authenticate");
    session.close().await;

    // The stale session was discarded and a fresh connection opened.
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn auth_exhaustion_is_reported_with_the_try_count() {
    let key = test_key(&[1]);
    let transport = ScriptedTransport::always(ConnectStep::present_auth_failing(&key));

    let err = bootstrap(transport.clone(), 2)
        .run()
        .await
        .err()
        .expect("must exhaust auth tries");

    let BootstrapError::AuthExhausted { tries } = err else {
        panic!("expected AuthExhausted, got {err:?}");
    };
    assert_eq!(tries, 2);
    assert!(err.to_string().contains("after 2 attempts"));
    // Initial connect plus one reconnect for the second try.
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_for_auth_requires_the_pinned_key() {
    let pinned = test_key(b"K1");
    let imposter = test_key(b"K2");
    let transport = ScriptedTransport::new(vec![
        // Verified and pinned, but auth fails.
        ConnectStep::present_auth_failing(&pinned),
        // An imposter key on reconnect must fail the attempt...
        ConnectStep::present(&imposter),
        // ...and the next reconnect with the pinned key succeeds.
        ConnectStep::present(&pinned),
    ]);

    let session = bootstrap(transport.clone(), 3)
        .run()
        .await
        .expect("must succeed on the pinned key");
    session.close().await;

    assert_eq!(transport.connect_count(), 3);
    // The imposter connection was torn down, not used.
    assert_eq!(transport.abort_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_failures_count_against_the_try_budget() {
    let key = test_key(&[1]);
    let transport = ScriptedTransport::new(vec![
        ConnectStep::present_auth_failing(&key),
        // Both reconnect attempts are refused at the network level.
        ConnectStep::Refuse,
        ConnectStep::Refuse,
    ]);

    let err = bootstrap(transport.clone(), 3)
        .run()
        .await
        .err()
        .expect("must exhaust auth tries");

    assert!(matches!(err, BootstrapError::AuthExhausted { tries: 3 }));
    assert_eq!(transport.connect_count(), 3);
}
