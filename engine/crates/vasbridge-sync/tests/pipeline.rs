//! Poll, diff and publish across both sinks with in-memory collaborators

use std::sync::Arc;
use std::time::Duration;
use vasbridge_convert::{ConverterContext, FullConverter};
use vasbridge_core::{Report, Vulnerability};
use vasbridge_sync::{
    ConsumerSettings, EventConsumer, EventPublisher, Fetcher, Lifecycle, MapHandler, Outcome, WorkerExit,
};
use vasbridge_transport::events::CONTENT_TYPE;
use vasbridge_transport::ifmap::PublishElement;
use vasbridge_transport::testing::{MemoryBroker, MemoryMap, MemoryScanSource};
use vasbridge_transport::{
    ControlEvent, DeleteTaskRequest, Delivery, TaskInformation, VulnerabilityEvent,
};

fn v(id: &str) -> Vulnerability {
    Vulnerability::builder(id, "192.168.7.8").build()
}

/// Event ids of the updates and deletes in a publish request
fn changes(element: &[PublishElement]) -> (Vec<String>, Vec<String>) {
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    for element in element {
        match element {
            PublishElement::Update(u) => updates.push(
                u.metadata[0]
                    .child_value("other-type-definition")
                    .unwrap_or_default()
                    .to_string(),
            ),
            PublishElement::Delete(d) => {
                let filter = d.filter.clone().unwrap_or_default();
                let id = filter
                    .split("other-type-definition='")
                    .nth(1)
                    .and_then(|rest| rest.split('\'').next())
                    .unwrap_or_default()
                    .to_string();
                deletes.push(id);
            }
            PublishElement::Notify(_) => {}
        }
    }
    updates.sort();
    (updates, deletes)
}

#[tokio::test]
async fn test_two_cycles_emit_only_changes() {
    let source = Arc::new(MemoryScanSource::new("scanner").with_report("T1", Report::new("t1", vec![v("A"), v("B")])));
    let map = Arc::new(MemoryMap::with_session("pub-1"));
    let broker = Arc::new(MemoryBroker::new());

    let mut fetcher = Fetcher::new(source.clone(), Duration::from_secs(30));
    let mut handler = MapHandler::new(
        map.clone(),
        Box::new(FullConverter::new(ConverterContext::new("pub-1", "openvas@scanner"))),
        fetcher.subscribe("map-handler"),
    );
    let mut publisher = EventPublisher::new(broker.clone(), "vasbridge", "pub-1", fetcher.subscribe("event-publisher"));

    // cycle 1
    assert_eq!(fetcher.poll_once().await, 1);
    handler.drain().await.unwrap();
    publisher.drain().await.unwrap();

    // cycle 2
    source.set_report("T1", Report::new("t1", vec![v("B"), v("C")]));
    assert_eq!(fetcher.poll_once().await, 1);
    handler.drain().await.unwrap();
    publisher.drain().await.unwrap();

    let requests = map.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(changes(&requests[0].elements), (vec!["A".into(), "B".into()], vec![]));
    assert_eq!(changes(&requests[1].elements), (vec!["C".into()], vec!["A".into()]));

    let events: Vec<(String, bool)> = broker
        .published()
        .iter()
        .map(|m| {
            let event: VulnerabilityEvent = serde_json::from_slice(&m.payload).unwrap();
            (event.id, event.new_event)
        })
        .collect();
    assert_eq!(
        events,
        vec![
            ("A".to_string(), true),
            ("B".to_string(), true),
            ("C".to_string(), true),
            ("A".to_string(), false),
        ]
    );

    // cycle 3 without change
    assert_eq!(fetcher.poll_once().await, 1);
    assert_eq!(handler.drain().await.unwrap(), 0);
    assert_eq!(publisher.drain().await.unwrap(), 0);
    assert_eq!(map.requests().len(), 2);
}

#[tokio::test]
async fn test_delete_event_for_unknown_task_is_noop() {
    let source = Arc::new(MemoryScanSource::new("scanner").with_config("cfg-1", "Full and fast"));
    let broker = Arc::new(MemoryBroker::new());

    let mut consumer = EventConsumer::new(
        source.clone(),
        broker.clone(),
        ConsumerSettings {
            queue: "vasbridge-scan".into(),
            durable: true,
            allow_delete_event: true,
            default_config: "Full and fast".into(),
            name_prefix: "vasbridge".into(),
        },
    );
    consumer.prepare().await.unwrap();

    let event = ControlEvent::DeleteTasks(DeleteTaskRequest {
        task_infos: vec![TaskInformation {
            name_prefix: "vasbridge".into(),
            ip: "10.9.9.9".into(),
            timestamp: 1,
        }],
    });
    let delivery = Delivery {
        delivery_tag: 11,
        content_type: Some(CONTENT_TYPE.into()),
        body: event.encode().unwrap(),
    };

    assert_eq!(consumer.handle(&delivery).await.unwrap(), Outcome::Deleted(0));
    assert!(source.calls().is_empty());
    assert_eq!(broker.acks(), vec![11]);
}

#[tokio::test]
async fn test_supervised_workers_shut_down_together() {
    let source = Arc::new(MemoryScanSource::new("scanner").with_report("T1", Report::new("t1", vec![v("A")])));
    let map = Arc::new(MemoryMap::with_session("pub-1"));

    let mut lifecycle = Lifecycle::new();
    let mut fetcher = Fetcher::new(source, Duration::from_secs(3600));
    let handler = MapHandler::new(
        map.clone(),
        Box::new(FullConverter::new(ConverterContext::new("pub-1", "openvas@scanner"))),
        fetcher.subscribe("map-handler"),
    );
    let (fetcher_token, handler_token) = (lifecycle.token(), lifecycle.token());
    lifecycle.spawn("fetcher", fetcher.run(fetcher_token));
    lifecycle.spawn("map-handler", handler.run(handler_token));

    let published = {
        let map = map.clone();
        async move {
            while map.requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    };
    let summary = lifecycle.run_until_shutdown(published).await;

    assert_eq!(summary.exits.len(), 2);
    assert!(summary.exits.iter().all(|(_, exit)| *exit == WorkerExit::Interrupted));
    assert_eq!(map.stored_count(), 1);
}
