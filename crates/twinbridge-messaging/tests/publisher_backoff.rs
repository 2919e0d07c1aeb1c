//! Publish-handle recovery: exponential backoff schedule and closure
//! deduplication, observed with a mocked handle factory on virtual time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use twinbridge_messaging::publisher::{
    spawn_publisher, MappedOutbound, OutboundPublish, PublishHandle, PublishHandleFactory,
    PublisherCommand, PublisherHandle,
};
use twinbridge_messaging::BackoffConfig;
use twinbridge_model::{ExternalMessage, Headers, SubscribedTopic, Target};

struct CountingFactory {
    creates: Arc<AtomicUsize>,
    published: Arc<AtomicUsize>,
}

struct CountingHandle {
    published: Arc<AtomicUsize>,
}

#[async_trait]
impl PublishHandleFactory for CountingFactory {
    async fn create_handle(
        &self,
        _address: &str,
    ) -> Result<Box<dyn PublishHandle>, twinbridge_model::ConnectivityError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingHandle {
            published: Arc::clone(&self.published),
        }))
    }
}

#[async_trait]
impl PublishHandle for CountingHandle {
    async fn publish(
        &self,
        _publish: &OutboundPublish,
    ) -> Result<(), twinbridge_model::ConnectivityError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn outbound() -> MappedOutbound {
    let mut target = Target::new("outbound", vec![SubscribedTopic::TwinEvents]);
    target.qos = Some(0);
    MappedOutbound {
        target: Some(target),
        message: ExternalMessage::builder(Headers::new())
            .with_text("payload")
            .build(),
    }
}

fn spawn(
    creates: &Arc<AtomicUsize>,
    published: &Arc<AtomicUsize>,
) -> PublisherHandle {
    spawn_publisher(
        "backoff-test".into(),
        Box::new(CountingFactory {
            creates: Arc::clone(creates),
            published: Arc::clone(published),
        }),
        BackoffConfig::default(),
        false,
    )
}

/// Lets the worker and its timers run without advancing the clock.
async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

async fn close_handle(publisher: &PublisherHandle) {
    publisher
        .tx
        .send(PublisherCommand::HandleClosed {
            address: "outbound".to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn recovers_with_doubling_backoff() {
    let creates = Arc::new(AtomicUsize::new(0));
    let published = Arc::new(AtomicUsize::new(0));
    let publisher = spawn(&creates, &published);

    // handle is cached: two publishes, one creation
    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    assert_eq!(published.load(Ordering::SeqCst), 2);

    // backoff starts at one second and doubles after each consecutive
    // closure; recreation happens at ~1s, ~3s and ~7s
    for i in 0..3u32 {
        close_handle(&publisher).await;
        settle().await;

        let delay = Duration::from_secs(1) * 2u32.pow(i);
        tokio::time::advance(delay + Duration::from_millis(100)).await;
        settle().await;

        let expected = 2 + i as usize;
        assert_eq!(
            creates.load(Ordering::SeqCst),
            expected,
            "after closure {i}"
        );
    }

    // nothing further happens within the ten-second window
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(creates.load(Ordering::SeqCst), 4);

    drop(publisher.tx);
    let _ = publisher.join.await;
}

#[tokio::test(start_paused = true)]
async fn closures_during_backoff_are_ignored() {
    let creates = Arc::new(AtomicUsize::new(0));
    let published = Arc::new(AtomicUsize::new(0));
    let publisher = spawn(&creates, &published);

    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(creates.load(Ordering::SeqCst), 1);

    // three rapid closures: only the first starts a backoff
    close_handle(&publisher).await;
    close_handle(&publisher).await;
    close_handle(&publisher).await;
    settle().await;

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(creates.load(Ordering::SeqCst), 2);

    drop(publisher.tx);
    let _ = publisher.join.await;
}

#[tokio::test(start_paused = true)]
async fn publish_during_backoff_is_dropped() {
    let creates = Arc::new(AtomicUsize::new(0));
    let published = Arc::new(AtomicUsize::new(0));
    let publisher = spawn(&creates, &published);

    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    settle().await;
    close_handle(&publisher).await;
    settle().await;

    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(published.load(Ordering::SeqCst), 1, "message dropped during backoff");

    let (status_tx, status_rx) = oneshot::channel();
    publisher
        .tx
        .send(PublisherCommand::RetrieveStatus(status_tx))
        .await
        .unwrap();
    settle().await;
    let status = status_rx.await.unwrap();
    assert_eq!(status.backing_off_addresses, vec!["outbound".to_string()]);
    assert_eq!(status.failed, 1);

    drop(publisher.tx);
    let _ = publisher.join.await;
}

#[tokio::test(start_paused = true)]
async fn dry_run_publishes_nothing() {
    let creates = Arc::new(AtomicUsize::new(0));
    let published = Arc::new(AtomicUsize::new(0));
    let publisher = spawn_publisher(
        "dry-run".into(),
        Box::new(CountingFactory {
            creates: Arc::clone(&creates),
            published: Arc::clone(&published),
        }),
        BackoffConfig::default(),
        true,
    );

    publisher
        .tx
        .send(PublisherCommand::Publish(outbound()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(creates.load(Ordering::SeqCst), 0);
    assert_eq!(published.load(Ordering::SeqCst), 0);

    drop(publisher.tx);
    let _ = publisher.join.await;
}

#[tokio::test(start_paused = true)]
async fn response_without_reply_to_is_dropped() {
    let creates = Arc::new(AtomicUsize::new(0));
    let published = Arc::new(AtomicUsize::new(0));
    let publisher = spawn(&creates, &published);

    publisher
        .tx
        .send(PublisherCommand::Publish(MappedOutbound {
            target: None,
            message: ExternalMessage::builder(Headers::new())
                .with_text("reply")
                .build(),
        }))
        .await
        .unwrap();
    settle().await;
    assert_eq!(published.load(Ordering::SeqCst), 0);

    // with a reply-to header the reply is routed
    publisher
        .tx
        .send(PublisherCommand::Publish(MappedOutbound {
            target: None,
            message: ExternalMessage::builder(Headers::new().with("reply-to", "replies"))
                .with_text("reply")
                .build(),
        }))
        .await
        .unwrap();
    settle().await;
    assert_eq!(published.load(Ordering::SeqCst), 1);

    drop(publisher.tx);
    let _ = publisher.join.await;
}
