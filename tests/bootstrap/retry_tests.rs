//! Connection retry loop behavior: transient vs. fatal classification,
//! deadlines, quarantine short-circuiting and cancellation.

use std::sync::Arc;
use std::time::Duration;

use gatehouse::bootstrap::{BackoffPolicy, BootstrapConfig, NodeBootstrap};
use gatehouse::cloud::InstanceState;
use gatehouse::error::{BootstrapError, CloudError};
use gatehouse::quarantine::{OfflineMarker, QuarantineList};
use gatehouse::store::HostKeyStore;
use gatehouse::trust::{KEY_CHECK_FAILED, VerificationStrategy};

use crate::fixtures::{
    ConnectStep, FakeInstance, ScriptedTransport, memory_key_store, test_credential, test_key,
};

const NODE: &str = "i-abc";

fn quick_config(launch_timeout: Option<Duration>) -> BootstrapConfig {
    BootstrapConfig {
        launch_timeout,
        connect_timeout: Duration::from_secs(10),
        retry: BackoffPolicy::fixed(Duration::from_secs(5)),
        auth_tries: 3,
        auth_retry_interval: Duration::from_secs(5),
    }
}

fn bootstrap(
    instance: Arc<FakeInstance>,
    transport: Arc<ScriptedTransport>,
    store: Arc<HostKeyStore>,
    offline: Arc<QuarantineList>,
    strategy: VerificationStrategy,
    config: BootstrapConfig,
) -> NodeBootstrap {
    NodeBootstrap::new(
        NODE,
        22,
        "admin",
        test_credential(),
        strategy,
        instance,
        transport,
        store,
        offline,
    )
    .with_config(config)
}

#[tokio::test(start_paused = true)]
async fn unroutable_address_never_connects_and_times_out() {
    let instance = FakeInstance::running(NODE).with_address("0.0.0.0").shared();
    let transport = ScriptedTransport::refusing();
    let offline = Arc::new(QuarantineList::new());

    let err = bootstrap(
        instance,
        transport.clone(),
        memory_key_store(),
        offline,
        VerificationStrategy::AcceptNew,
        quick_config(Some(Duration::from_secs(30))),
    )
    .run()
    .await
    .err()
    .expect("must time out");

    // The sentinel address is a precondition failure, not a transport error:
    // no transport-level connect may ever be attempted.
    assert_eq!(transport.connect_count(), 0);
    let BootstrapError::TimedOut { elapsed_secs, .. } = err else {
        panic!("expected TimedOut, got {err:?}");
    };
    assert!(elapsed_secs >= 30);
    assert!(err.to_string().contains(&format!("{elapsed_secs} seconds")));
}

#[tokio::test(start_paused = true)]
async fn empty_address_is_also_transient() {
    let instance = FakeInstance::running(NODE).with_address("").shared();
    let transport = ScriptedTransport::refusing();

    let err = bootstrap(
        instance,
        transport.clone(),
        memory_key_store(),
        Arc::new(QuarantineList::new()),
        VerificationStrategy::AcceptNew,
        quick_config(Some(Duration::from_secs(20))),
    )
    .run()
    .await
    .err()
    .expect("must time out");

    assert_eq!(transport.connect_count(), 0);
    assert!(matches!(err, BootstrapError::TimedOut { .. }));
}

#[tokio::test(start_paused = true)]
async fn connection_refused_is_retried_until_the_deadline() {
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::refusing();

    let err = bootstrap(
        instance,
        transport.clone(),
        memory_key_store(),
        Arc::new(QuarantineList::new()),
        VerificationStrategy::AcceptNew,
        quick_config(Some(Duration::from_secs(30))),
    )
    .run()
    .await
    .err()
    .expect("must time out");

    assert!(matches!(err, BootstrapError::TimedOut { .. }));
    // 30s deadline with 5s pauses: several attempts, not just one.
    assert!(transport.connect_count() >= 5, "{}", transport.connect_count());
}

#[tokio::test(start_paused = true)]
async fn already_quarantined_node_is_not_contacted() {
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::refusing();
    let offline = Arc::new(QuarantineList::new());
    offline.set_quarantined(NODE, &format!("{KEY_CHECK_FAILED}: key changed"));

    let err = bootstrap(
        instance,
        transport.clone(),
        memory_key_store(),
        offline,
        VerificationStrategy::AcceptNew,
        quick_config(None),
    )
    .run()
    .await
    .err()
    .expect("must abort");

    assert_eq!(transport.connect_count(), 0);
    let BootstrapError::Quarantined { node, reason } = err else {
        panic!("expected Quarantined, got {err:?}");
    };
    assert_eq!(node, NODE);
    assert!(reason.starts_with(KEY_CHECK_FAILED));
}

#[tokio::test(start_paused = true)]
async fn offline_for_unrelated_reasons_does_not_stop_the_loop() {
    let key = test_key(&[1]);
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::always(ConnectStep::present(&key));
    let offline = Arc::new(QuarantineList::new());
    // Marked offline, but not by a trust decision.
    offline.set_quarantined(NODE, "disk full");

    let session = bootstrap(
        instance,
        transport,
        memory_key_store(),
        offline,
        VerificationStrategy::AcceptNew,
        quick_config(Some(Duration::from_secs(30))),
    )
    .run()
    .await
    .expect("bootstrap must proceed");
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn key_mismatch_stops_retrying_immediately() {
    let stored = test_key(b"K1");
    let presented = test_key(b"K2");
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::always(ConnectStep::present(&presented));
    let store = memory_key_store();
    let offline = Arc::new(QuarantineList::new());
    store.save(NODE, &stored).unwrap();

    let err = bootstrap(
        instance,
        transport.clone(),
        store,
        offline.clone(),
        VerificationStrategy::AcceptNew,
        quick_config(None), // no deadline: quarantine must end the loop
    )
    .run()
    .await
    .err()
    .expect("must quarantine");

    let BootstrapError::Quarantined { reason, .. } = err else {
        panic!("expected Quarantined, got {err:?}");
    };
    assert!(reason.contains("man-in-the-middle"), "{reason}");
    // One connect, one aborted handshake, no second attempt.
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(transport.abort_count(), 1);
    assert!(offline.is_quarantined(NODE));
}

#[tokio::test(start_paused = true)]
async fn untrusted_but_not_quarantined_keeps_retrying() {
    // CheckHard with a blank console: every verify says "not yet", and the
    // loop must treat that as transient rather than fatal.
    let key = test_key(&[7]);
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::always(ConnectStep::present(&key));

    let err = bootstrap(
        instance,
        transport.clone(),
        memory_key_store(),
        Arc::new(QuarantineList::new()),
        VerificationStrategy::CheckHard,
        quick_config(Some(Duration::from_secs(20))),
    )
    .run()
    .await
    .err()
    .expect("must time out");

    assert!(matches!(err, BootstrapError::TimedOut { .. }));
    assert!(transport.connect_count() > 1);
    // Every rejected attempt tore its connection down; none proceeded.
    assert_eq!(transport.abort_count(), transport.connect_count());
    assert_eq!(transport.proceed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn console_appearing_mid_bootstrap_completes_check_hard() {
    let key = test_key(&[7]);
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::always(ConnectStep::present(&key));
    let store = memory_key_store();

    let handle = tokio::spawn(
        bootstrap(
            instance.clone(),
            transport,
            store.clone(),
            Arc::new(QuarantineList::new()),
            VerificationStrategy::CheckHard,
            quick_config(None),
        )
        .run(),
    );

    // Let a few blank-console rounds pass, then print the key.
    tokio::time::sleep(Duration::from_secs(12)).await;
    instance.set_console(&format!(
        "boot\n{} {}\n",
        key.algorithm(),
        data_encoding::BASE64.encode(key.key())
    ));

    let session = handle.await.unwrap().expect("bootstrap must succeed");
    session.close().await;
    assert_eq!(store.get(NODE).unwrap(), Some(key));
}

#[tokio::test(start_paused = true)]
async fn terminated_instance_is_fatal() {
    let instance = FakeInstance::running(NODE)
        .with_state(InstanceState::Terminated)
        .shared();
    let transport = ScriptedTransport::refusing();

    let err = bootstrap(
        instance,
        transport.clone(),
        memory_key_store(),
        Arc::new(QuarantineList::new()),
        VerificationStrategy::AcceptNew,
        quick_config(None),
    )
    .run()
    .await
    .err()
    .expect("must fail");

    assert!(matches!(
        err,
        BootstrapError::Cloud(CloudError::Terminated(_))
    ));
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn happy_path_yields_an_authenticated_session() {
    let key = test_key(&[3, 3]);
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::always(ConnectStep::present(&key));
    let store = memory_key_store();

    let mut session = bootstrap(
        instance,
        transport.clone(),
        store.clone(),
        Arc::new(QuarantineList::new()),
        VerificationStrategy::AcceptNew,
        quick_config(Some(Duration::from_secs(60))),
    )
    .run()
    .await
    .expect("bootstrap must succeed");

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(transport.proceed_count(), 1);
    assert_eq!(store.get(NODE).unwrap(), Some(key));

    // The session is ready for the agent launch sequence.
    let out = session.exec("echo ready").await.unwrap();
    assert!(out.success());
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_promptly_without_side_effects() {
    let instance = FakeInstance::running(NODE).shared();
    let transport = ScriptedTransport::refusing();
    let store = memory_key_store();
    let offline = Arc::new(QuarantineList::new());

    let sequence = bootstrap(
        instance,
        transport,
        store.clone(),
        offline.clone(),
        VerificationStrategy::AcceptNew,
        quick_config(None), // would retry forever without cancellation
    );
    let cancel = sequence.cancellation_token();

    let handle = tokio::spawn(sequence.run());
    tokio::time::sleep(Duration::from_secs(7)).await;
    cancel.cancel();

    let err = handle.await.unwrap().err().expect("must be cancelled");
    assert!(matches!(err, BootstrapError::Cancelled));
    assert!(store.get(NODE).unwrap().is_none());
    assert!(!offline.is_quarantined(NODE));
}
