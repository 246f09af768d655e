//! Deployment queue tests

use std::time::Duration;

use confdeploy::deploy::queue::{DeploymentQueue, QueueEvent, QueueOptions};
use confdeploy::errors::DeployError;
use confdeploy::models::deployment::{DeploymentTask, Priority};

fn task(id: &str, priority: Option<Priority>) -> DeploymentTask {
    let mut task = DeploymentTask::deployment("config-repo", "main", "tester").with_id(id);
    task.priority = priority;
    task
}

#[tokio::test]
async fn test_higher_priority_dequeues_first() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    queue.enqueue(task("d1", Some(Priority::Normal))).unwrap();
    queue.enqueue(task("d2", Some(Priority::High))).unwrap();

    assert_eq!(queue.dequeue().unwrap().id, "d2");
    assert_eq!(queue.dequeue().unwrap().id, "d1");
    assert!(queue.dequeue().is_none());
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    queue.enqueue(task("n1", None)).unwrap();
    queue.enqueue(task("u1", Some(Priority::Urgent))).unwrap();
    queue.enqueue(task("n2", None)).unwrap();
    queue.enqueue(task("l1", Some(Priority::Low))).unwrap();
    queue.enqueue(task("u2", Some(Priority::Urgent))).unwrap();

    let order: Vec<String> = queue.pending().into_iter().map(|t| t.id).collect();
    assert_eq!(order, vec!["u1", "u2", "n1", "n2", "l1"]);
}

#[tokio::test]
async fn test_duplicate_ids_rejected_while_queued_or_processing() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    queue.enqueue(task("d1", None)).unwrap();
    assert!(matches!(
        queue.enqueue(task("d1", None)),
        Err(DeployError::DuplicateTask(id)) if id == "d1"
    ));

    queue.dequeue().unwrap();
    assert!(matches!(
        queue.enqueue(task("d1", None)),
        Err(DeployError::DuplicateTask(_))
    ));

    assert!(queue.mark_completed("d1"));
    queue.enqueue(task("d1", None)).unwrap();
}

#[tokio::test]
async fn test_capacity_rejects_without_mutation() {
    let queue = DeploymentQueue::new(QueueOptions {
        max_size: 2,
        ..Default::default()
    });
    queue.enqueue(task("d1", None)).unwrap();
    queue.enqueue(task("d2", None)).unwrap();

    let result = queue.enqueue(task("d3", Some(Priority::Urgent)));
    assert!(matches!(result, Err(DeployError::Capacity { max_size: 2 })));
    assert_eq!(queue.len(), 2);
    assert!(!queue.contains("d3"));
}

#[tokio::test]
async fn test_mark_completed_and_failed_are_idempotent() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    let mut events = queue.subscribe();
    queue.enqueue(task("d1", None)).unwrap();
    queue.dequeue().unwrap();

    assert!(queue.mark_failed("d1", "boom"));
    assert!(!queue.mark_failed("d1", "boom"));
    assert!(!queue.mark_completed("d1"));
    assert!(!queue.mark_completed("never-seen"));

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(
        received,
        vec![
            QueueEvent::Enqueued {
                id: "d1".to_string(),
                priority: Priority::Normal
            },
            QueueEvent::Dequeued {
                id: "d1".to_string()
            },
            QueueEvent::Failed {
                id: "d1".to_string(),
                reason: "boom".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_retry_elevates_and_exhausts() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    queue
        .enqueue(task("d1", Some(Priority::Low)).with_max_retries(1))
        .unwrap();
    queue.dequeue().unwrap();

    let retried = queue.retry("d1").unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.priority, Some(Priority::High));
    assert!(queue.contains("d1"));

    queue.dequeue().unwrap();
    assert!(matches!(
        queue.retry("d1"),
        Err(DeployError::RetriesExhausted { attempts: 1, .. })
    ));
    assert!(queue.is_processing("d1"));

    assert!(matches!(queue.retry("unknown"), Err(DeployError::NotFound(_))));
}

#[tokio::test]
async fn test_processing_timeout_evicts() {
    let queue = DeploymentQueue::new(QueueOptions {
        processing_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let mut events = queue.subscribe();
    queue.enqueue(task("slow", None)).unwrap();
    queue.dequeue().unwrap();
    assert!(queue.is_processing("slow"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!queue.is_processing("slow"));
    assert!(!queue.mark_completed("slow"));

    let mut timed_out = false;
    while let Ok(event) = events.try_recv() {
        if event == (QueueEvent::TimedOut { id: "slow".to_string() }) {
            timed_out = true;
        }
    }
    assert!(timed_out);
}

#[tokio::test]
async fn test_completed_task_is_not_evicted_later() {
    let queue = DeploymentQueue::new(QueueOptions {
        processing_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let mut events = queue.subscribe();
    queue.enqueue(task("fast", None)).unwrap();
    queue.dequeue().unwrap();
    assert!(queue.mark_completed("fast"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, QueueEvent::TimedOut { .. }));
    }
}

#[tokio::test]
async fn test_clear_and_remove_leave_in_flight_alone() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    queue.enqueue(task("d1", None)).unwrap();
    queue.enqueue(task("d2", None)).unwrap();
    queue.enqueue(task("d3", None)).unwrap();
    queue.dequeue().unwrap();

    assert_eq!(queue.remove("d2").map(|t| t.id), Some("d2".to_string()));
    assert!(queue.remove("d1").is_none());
    assert_eq!(queue.clear(), 1);
    assert!(queue.is_empty());
    assert!(queue.is_processing("d1"));
}

#[tokio::test]
async fn test_status_counts() {
    let queue = DeploymentQueue::new(QueueOptions::default());
    queue.enqueue(task("d1", Some(Priority::High))).unwrap();
    queue.enqueue(task("d2", None)).unwrap();
    queue.enqueue(task("d3", None)).unwrap();
    queue.dequeue().unwrap();

    let status = queue.status();
    assert_eq!(status.queue_length, 2);
    assert_eq!(status.processing_count, 1);
    assert_eq!(status.processing, vec!["d1".to_string()]);
    assert_eq!(status.by_priority.get(&Priority::Normal), Some(&2));
    assert_eq!(status.by_priority.get(&Priority::High), None);
    assert_eq!(status.max_size, 100);
}
