//! End-to-end flows through the notifier: sync, blink, dismiss, acknowledge.
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, message_response, MockConnector, Recorder, ScriptedBackend};
use pinotify::command::{Command, CommandEncoder, CommandOutcome};
use pinotify::config::ArmedFlag;
use pinotify::link::{LinkError, LinkTransport};
use pinotify::notifier::Notifier;
use pinotify::state::{ActiveMessage, MemoryBackend, StateStore, ACK_UNSET};
use pinotify::sync::{
    BackendApi, DeviceRequest, DeviceResponse, SyncClient, SyncError, SyncOutcome,
};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    notifier: Notifier,
    backend: Arc<ScriptedBackend>,
    connector: Arc<MockConnector>,
    display: Arc<Recorder>,
    armed: ArmedFlag,
}

fn harness(armed: bool) -> Harness {
    let armed = ArmedFlag::new(armed);
    let store = Arc::new(StateStore::open(MemoryBackend::new(), Some("dev-1".into())).unwrap());
    let backend = ScriptedBackend::new();
    let sync = Arc::new(SyncClient::new(store, backend.clone(), armed.clone()));

    let connector = MockConnector::new();
    let transport = Arc::new(
        LinkTransport::new(connector.clone(), "/dev/rfcomm0", 3)
            .with_close_grace(Duration::from_millis(500)),
    );
    let encoder = CommandEncoder::new(transport, armed.clone(), Command::blink(2, 2).unwrap());

    let notifier = Notifier::new(sync, encoder);
    let display = Recorder::new();
    notifier.add_display(display.clone());
    Harness {
        notifier,
        backend,
        connector,
        display,
        armed,
    }
}

fn hi() -> ActiveMessage {
    ActiveMessage::new("bob", "hi", 1000)
}

#[tokio::test]
async fn disarmed_device_neither_syncs_nor_blinks() {
    let h = harness(false);
    h.notifier
        .store()
        .set_active_message(Some(hi()))
        .await
        .unwrap();
    h.backend.respond_message("eve", "later", 2000);

    assert_eq!(
        h.notifier.sync().request_sync(None).await.unwrap(),
        SyncOutcome::Disarmed
    );
    assert_eq!(
        h.notifier.encoder().start_blinking().await.unwrap(),
        CommandOutcome::Disarmed
    );
    assert!(matches!(
        h.notifier.encoder().wait_for_blink().await,
        Some(Ok(CommandOutcome::Disarmed))
    ));
    assert!(h.backend.requests().is_empty());
    assert_eq!(h.connector.opens(), 0);
    assert_eq!(h.notifier.store().active_message(), Some(hi()));
}

#[tokio::test]
async fn new_message_is_displayed_once_and_blinks() {
    let h = harness(true);
    h.backend.respond_message("bob", "hi", 1000);

    let outcome = h.notifier.sync().request_sync(Some(11)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Applied { changed: true });
    assert_eq!(h.notifier.store().active_message(), Some(hi()));
    assert_eq!(h.display.seen(), vec![Some(hi())]);

    let blink = h.notifier.encoder().wait_for_blink().await;
    assert!(matches!(blink, Some(Ok(CommandOutcome::Sent { attempts: 1 }))));
    assert_eq!(h.connector.written(), vec![0x22]);
}

#[tokio::test]
async fn duplicate_push_does_not_blink_again() {
    let h = harness(true);
    h.backend.respond_message("bob", "hi", 1000);
    h.backend.respond_message("bob", "hi", 1000);

    h.notifier.sync().request_sync(Some(1)).await.unwrap();
    assert!(h.notifier.encoder().wait_for_blink().await.is_some());

    let outcome = h.notifier.sync().request_sync(Some(1)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Applied { changed: false });
    assert!(h.notifier.encoder().wait_for_blink().await.is_none());
    assert_eq!(h.display.seen().len(), 1);
    assert_eq!(h.connector.written(), vec![0x22]);
}

#[tokio::test]
async fn ack_advances_watermark_clears_and_syncs() {
    let h = harness(true);
    h.backend.respond_message("bob", "hi", 1000);
    h.notifier.sync().request_sync(None).await.unwrap();

    let acked = assert_ok!(h.notifier.ack_current_message().await);
    assert_eq!(acked, Some(hi()));
    assert_eq!(h.notifier.store().acked_until_utc(), 1000);
    assert_eq!(h.notifier.store().active_message(), None);
    assert_eq!(h.display.seen(), vec![Some(hi()), None]);

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].acked_until_utc, 1000);
    assert_eq!(requests[1].caused_by_push_id, None);
}

#[tokio::test]
async fn repeated_ack_is_a_no_op() {
    let h = harness(true);
    h.notifier
        .store()
        .set_active_message(Some(hi()))
        .await
        .unwrap();

    assert!(h.notifier.ack_current_message().await.unwrap().is_some());
    let before = h.backend.requests().len();
    assert!(h.notifier.ack_current_message().await.unwrap().is_none());

    assert_eq!(h.notifier.store().acked_until_utc(), 1000);
    assert_eq!(h.backend.requests().len(), before);
}

#[tokio::test]
async fn ack_holds_even_when_follow_up_sync_fails() {
    let h = harness(true);
    h.notifier
        .store()
        .set_active_message(Some(hi()))
        .await
        .unwrap();
    h.backend
        .respond(Err(SyncError::Transport("offline".into())));

    assert_eq!(h.notifier.ack_current_message().await.unwrap(), Some(hi()));
    assert_eq!(h.notifier.store().acked_until_utc(), 1000);
    assert_eq!(h.notifier.store().active_message(), None);

    // The next sync reports the watermark the failed one could not.
    h.notifier.sync().request_sync(None).await.unwrap();
    assert_eq!(h.backend.requests().last().unwrap().acked_until_utc, 1000);
}

#[tokio::test]
async fn dismiss_byte_from_indicator_acknowledges() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(None);

    h.backend.respond_message("bob", "hi", 1000);
    assert!(triggers.push(Some(5)));
    assert!(eventually(WAIT, || h.connector.written() == vec![0x22]).await);

    h.connector.deliver(&[0x00]);
    let store = h.notifier.store().clone();
    assert!(eventually(WAIT, || store.active_message().is_none()).await);
    assert_eq!(store.acked_until_utc(), 1000);
    assert!(eventually(WAIT, || h.backend.requests().len() == 2).await);
    assert_eq!(h.backend.requests()[1].acked_until_utc, 1000);

    assert!(triggers.shutdown());
    service.await.unwrap();
}

#[tokio::test]
async fn non_dismiss_bytes_are_ignored() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(None);

    h.notifier
        .store()
        .set_active_message(Some(hi()))
        .await
        .unwrap();
    assert!(h.notifier.encoder().wait_for_blink().await.is_some());

    h.connector.deliver(&[0x22]);
    h.connector.deliver(&[0x7F]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.notifier.store().active_message(), Some(hi()));
    assert_eq!(h.notifier.store().acked_until_utc(), ACK_UNSET);

    triggers.shutdown();
    service.await.unwrap();
}

#[tokio::test]
async fn dismiss_without_active_message_changes_nothing() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(None);

    let outcome = assert_ok!(h.notifier.encoder().start_blinking().await);
    assert_eq!(outcome, CommandOutcome::Sent { attempts: 1 });
    h.connector.deliver(&[0x00]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.notifier.store().acked_until_utc(), ACK_UNSET);
    assert!(h.backend.requests().is_empty());

    triggers.shutdown();
    service.await.unwrap();
}

#[tokio::test]
async fn poll_timer_triggers_syncs() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(Some(Duration::from_millis(50)));

    assert!(eventually(WAIT, || h.backend.requests().len() >= 2).await);
    assert!(h
        .backend
        .requests()
        .iter()
        .all(|r| r.caused_by_push_id.is_none()));

    triggers.shutdown();
    service.await.unwrap();
}

#[tokio::test]
async fn device_token_trigger_stores_and_syncs() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(None);

    assert!(triggers.device_token("tok-2"));
    assert!(eventually(WAIT, || h.backend.requests().len() == 1).await);
    assert_eq!(h.notifier.store().device_token().as_deref(), Some("tok-2"));
    assert_eq!(h.backend.requests()[0].fcm_id.as_deref(), Some("tok-2"));

    triggers.shutdown();
    service.await.unwrap();
}

#[tokio::test]
async fn link_failure_keeps_the_message() {
    let h = harness(true);
    h.connector.set_device_present(false);
    h.backend.respond_message("bob", "hi", 1000);

    h.notifier.sync().request_sync(None).await.unwrap();
    let blink = h.notifier.encoder().wait_for_blink().await;
    assert!(matches!(blink, Some(Err(LinkError::DeviceNotFound(_)))));
    assert_eq!(h.notifier.store().active_message(), Some(hi()));
}

#[tokio::test]
async fn disarming_silences_later_triggers() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(None);
    h.armed.set(false);

    h.backend.respond_message("bob", "hi", 1000);
    triggers.push(None);
    triggers.poll();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.backend.requests().is_empty());
    assert_eq!(h.notifier.store().active_message(), None);

    triggers.shutdown();
    service.await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_the_loop() {
    let h = harness(true);
    let (triggers, service) = h.notifier.spawn(Some(Duration::from_secs(60)));
    assert!(triggers.shutdown());
    tokio::time::timeout(WAIT, service).await.unwrap().unwrap();
    assert!(!triggers.poll());
}

/// Answers after `delay` with `{bob, hi, 1000}` for as long as the request's
/// watermark says that message is still unacknowledged.
struct LaggingBackend {
    delay: Duration,
    requests: Mutex<Vec<DeviceRequest>>,
}

#[async_trait]
impl BackendApi for LaggingBackend {
    async fn device_request(&self, request: &DeviceRequest) -> Result<DeviceResponse, SyncError> {
        self.requests.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.delay).await;
        if request.acked_until_utc < 1000 {
            Ok(message_response("bob", "hi", 1000))
        } else {
            Ok(DeviceResponse::default())
        }
    }
}

#[tokio::test]
async fn late_push_response_does_not_restore_acked_message() {
    let armed = ArmedFlag::new(true);
    let store = Arc::new(StateStore::open(MemoryBackend::new(), Some("dev-1".into())).unwrap());
    let backend = Arc::new(LaggingBackend {
        delay: Duration::from_millis(200),
        requests: Mutex::new(Vec::new()),
    });
    let sync = Arc::new(SyncClient::new(store.clone(), backend.clone(), armed.clone()));
    let connector = MockConnector::new();
    let transport = Arc::new(
        LinkTransport::new(connector.clone(), "/dev/rfcomm0", 3)
            .with_close_grace(Duration::from_millis(500)),
    );
    let encoder = CommandEncoder::new(transport, armed, Command::blink(2, 2).unwrap());
    let notifier = Notifier::new(sync.clone(), encoder);
    let display = Recorder::new();
    notifier.add_display(display.clone());

    store.set_active_message(Some(hi())).await.unwrap();
    assert!(notifier.encoder().wait_for_blink().await.is_some());

    // Push sync leaves with the old watermark and answers after the ack.
    let push = sync.spawn_sync(Some(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(notifier.ack_current_message().await.unwrap(), Some(hi()));

    let outcome = push.await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Applied { changed: false });
    assert_eq!(backend.requests.lock().unwrap()[0].acked_until_utc, ACK_UNSET);

    assert_eq!(store.active_message(), None);
    assert_eq!(store.acked_until_utc(), 1000);
    assert_eq!(display.seen(), vec![Some(hi()), None]);
    assert!(notifier.encoder().wait_for_blink().await.is_none());
    assert_eq!(connector.written(), vec![0x22]);
}
