//! End-to-end tests of the structural master loop

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use structural_master::master::{
    ChannelMember, ConfigurationStore, LockManager, MemberMessage, MemoryConfigurationStore,
    MemoryLockManager, NodeIdentity, Outcome, SessionOperationId, SharedConfiguration,
    StructuralOperation, SubmitRequest, SubmitResponse, CONFIGURATION_RESOURCE,
};
use structural_master::oplog::{LogId, MemoryOperationLog, OperationLog};
use structural_master::{Error, MasterConfig, StructuralMaster};
use tokio::sync::{mpsc, oneshot};

type Inbox = mpsc::UnboundedReceiver<MemberMessage>;

fn config(quorum: usize, max_retries: u32) -> MasterConfig {
    MasterConfig {
        quorum,
        max_retries,
        operation_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn node(name: &str) -> NodeIdentity {
    NodeIdentity::new(name)
}

fn join(name: &str) -> StructuralOperation {
    StructuralOperation::NodeJoin {
        identity: node(name),
    }
}

fn connect(master: &StructuralMaster, names: &[&str]) -> Vec<Inbox> {
    names
        .iter()
        .map(|name| {
            let (member, inbox) = ChannelMember::new(node(name));
            master.connected(Arc::new(member)).unwrap();
            inbox
        })
        .collect()
}

fn drain(inbox: &mut Inbox) -> Vec<MemberMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = inbox.try_recv() {
        messages.push(message);
    }
    messages
}

fn propagated_ids(messages: &[MemberMessage]) -> Vec<LogId> {
    messages
        .iter()
        .filter_map(|m| match m {
            MemberMessage::Propagate { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

async fn next_propagate(inbox: &mut Inbox) -> LogId {
    loop {
        match inbox.recv().await {
            Some(MemberMessage::Propagate { id, .. }) => return id,
            Some(_) => continue,
            None => panic!("member channel closed"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_log_ids_strictly_increasing() {
    let log = Arc::new(MemoryOperationLog::new());
    let master = StructuralMaster::start(
        config(2, 10),
        log.clone(),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();

    for i in 0..5 {
        master
            .propagate_and_apply(join(&format!("n{}", i)), |_| {})
            .unwrap();
    }
    let status = master.status().await.unwrap();
    assert_eq!(status.pending, (0..5).map(LogId::new).collect::<Vec<_>>());
    assert_eq!(status.active_timers, 5);

    let ids: Vec<LogId> = log
        .iterate(LogId::new(0), LogId::new(100))
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ids.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_quorum_confirms_every_member_once() {
    let master = StructuralMaster::start(
        config(2, 10),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1", "n2", "n3"]);

    let (tx, rx) = oneshot::channel();
    master
        .propagate_and_apply(join("n4"), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    let id = next_propagate(&mut inboxes[0]).await;
    assert_eq!(id, LogId::new(0));
    master.receive_ack(node("n1"), id).unwrap();
    // a repeated ack from the same node must not count twice
    master.receive_ack(node("n1"), id).unwrap();
    assert_eq!(master.status().await.unwrap().pending, vec![id]);

    master.receive_ack(node("n2"), id).unwrap();
    assert_eq!(rx.await.unwrap(), Outcome::Committed(id));

    // late ack after commit is ignored
    master.receive_ack(node("n3"), id).unwrap();
    let status = master.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(status.active_timers, 0);

    for inbox in inboxes.iter_mut() {
        let confirms: Vec<_> = drain(inbox)
            .into_iter()
            .filter(|m| matches!(m, MemberMessage::Confirm { .. }))
            .collect();
        assert_eq!(confirms, vec![MemberMessage::Confirm { id }]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_repropagates_to_silent_members() {
    let master = StructuralMaster::start(
        config(3, 10),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1", "n2", "n3"]);

    master.propagate_and_apply(join("n4"), |_| {}).unwrap();
    let id = next_propagate(&mut inboxes[0]).await;
    master.receive_ack(node("n1"), id).unwrap();
    master.status().await.unwrap();
    for inbox in inboxes.iter_mut() {
        drain(inbox);
    }

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(propagated_ids(&drain(&mut inboxes[0])).is_empty());
    assert_eq!(propagated_ids(&drain(&mut inboxes[1])), vec![id]);
    assert_eq!(propagated_ids(&drain(&mut inboxes[2])), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_operation_stops_ticking() {
    let master = StructuralMaster::start(
        config(2, 3),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1"]);

    let (tx, rx) = oneshot::channel();
    master
        .propagate_and_apply(join("n4"), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(rx.await.unwrap(), Outcome::Abandoned(LogId::new(0)));

    // first propagation plus one per tick before the budget ran out
    assert_eq!(propagated_ids(&drain(&mut inboxes[0])).len(), 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = master.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(status.active_timers, 0);
    assert_eq!(status.stale_ticks, 0);
    assert!(drain(&mut inboxes[0]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_joins_append_once() {
    let log = Arc::new(MemoryOperationLog::new());
    let store = Arc::new(MemoryConfigurationStore::default());
    let master = StructuralMaster::start(config(2, 10), log.clone(), store.clone()).unwrap();
    let mut inboxes = connect(&master, &["n1", "n2", "n3"]);

    let first = master.join(node("n4")).unwrap();
    let second = master.join(node("n4")).unwrap();

    let id = next_propagate(&mut inboxes[0]).await;
    master.receive_ack(node("n1"), id).unwrap();
    master.receive_ack(node("n2"), id).unwrap();

    let responses = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(responses.iter().filter(|r| r.is_success()).count(), 1);
    let rejected = responses.iter().find(|r| !r.is_success()).unwrap();
    assert_eq!(rejected.error(), "Node Already Joined");

    assert_eq!(log.len(), 1);
    assert!(store.shared_configuration().exists_node(&node("n4")));
    assert_eq!(store.last_update_id(), Some(id));
}

#[tokio::test(start_paused = true)]
async fn test_create_database_checks_existing_names() {
    let mut initial = SharedConfiguration::new();
    initial.apply(&StructuralOperation::CreateDatabase {
        operation_id: SessionOperationId::new(),
        name: "orders".into(),
        database_type: "plocal".into(),
        configurations: BTreeMap::new(),
    });
    let log = Arc::new(MemoryOperationLog::new());
    let store = Arc::new(MemoryConfigurationStore::new(initial));
    let master = StructuralMaster::start(config(2, 10), log.clone(), store.clone()).unwrap();
    let mut inboxes = connect(&master, &["n1", "n2", "n3"]);

    let rejected = master
        .create_database(SessionOperationId::new(), "orders", "plocal", BTreeMap::new())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        rejected,
        SubmitResponse::CreateDatabase {
            success: false,
            error: "Database Already Exists".into()
        }
    );
    assert!(log.is_empty());

    let mut configurations = BTreeMap::new();
    configurations.insert("replicas".to_string(), "3".to_string());
    let pending = master
        .create_database(SessionOperationId::new(), "orders2", "plocal", configurations)
        .unwrap();

    let id = next_propagate(&mut inboxes[1]).await;
    master.receive_ack(node("n2"), id).unwrap();
    master.receive_ack(node("n3"), id).unwrap();

    assert!(pending.await.unwrap().is_success());
    assert_eq!(log.len(), 1);
    let database = store.shared_configuration().database("orders2").cloned().unwrap();
    assert_eq!(database.configurations.get("replicas").map(String::as_str), Some("3"));
}

#[tokio::test(start_paused = true)]
async fn test_drop_database_after_create() {
    let store = Arc::new(MemoryConfigurationStore::default());
    let master = StructuralMaster::start(
        config(1, 10),
        Arc::new(MemoryOperationLog::new()),
        store.clone(),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1"]);

    let created = master
        .create_database(SessionOperationId::new(), "orders", "plocal", BTreeMap::new())
        .unwrap();
    let id = next_propagate(&mut inboxes[0]).await;
    master.receive_ack(node("n1"), id).unwrap();
    assert!(created.await.unwrap().is_success());

    let dropped = master
        .drop_database(SessionOperationId::new(), "orders")
        .unwrap();
    let id = next_propagate(&mut inboxes[0]).await;
    master.receive_ack(node("n1"), id).unwrap();
    assert!(dropped.await.unwrap().is_success());

    assert!(!store.shared_configuration().exists_database("orders"));
}

#[tokio::test(start_paused = true)]
async fn test_remote_submit_replies_through_member() {
    let master = StructuralMaster::start(
        config(2, 10),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1", "n2"]);

    let operation_id = SessionOperationId::new();
    master
        .receive_submit(
            node("n1"),
            operation_id,
            SubmitRequest::DropDatabase {
                name: "ghost".into(),
            },
        )
        .unwrap();

    let reply = inboxes[0].recv().await.unwrap();
    assert_eq!(
        reply,
        MemberMessage::Reply {
            operation_id,
            response: SubmitResponse::DropDatabase {
                success: false,
                error: "Database Does Not Exist".into()
            }
        }
    );
    master.status().await.unwrap();
    assert!(drain(&mut inboxes[1]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_submit_times_out_without_quorum() {
    let log = Arc::new(MemoryOperationLog::new());
    let master = StructuralMaster::start(
        config(2, 2),
        log.clone(),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1"]);

    let response = master.join(node("n4")).unwrap().await.unwrap();
    assert_eq!(
        response,
        SubmitResponse::NodeJoin {
            success: false,
            error: "Operation timed out".into()
        }
    );
    // the entry stays in the log even though it never committed
    assert_eq!(log.len(), 1);

    // the configuration lock was released by the abandonment
    let _pending = master.join(node("n5")).unwrap();
    let mut id = next_propagate(&mut inboxes[0]).await;
    while id == LogId::new(0) {
        id = next_propagate(&mut inboxes[0]).await;
    }
    assert_eq!(id, LogId::new(1));
}

#[tokio::test(start_paused = true)]
async fn test_full_configuration_reflects_last_commit() {
    let master = StructuralMaster::start(
        config(1, 10),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1", "n2"]);

    let joined = master.join(node("n4")).unwrap();
    let id = next_propagate(&mut inboxes[0]).await;
    master.receive_ack(node("n1"), id).unwrap();
    assert!(joined.await.unwrap().is_success());
    drain(&mut inboxes[1]);

    master.send_full_configuration(node("n2")).await.unwrap();
    match inboxes[1].try_recv().unwrap() {
        MemberMessage::FullConfiguration {
            last_update_id,
            configuration,
        } => {
            assert_eq!(last_update_id, Some(id));
            assert!(configuration.exists_node(&node("n4")));
        }
        other => panic!("unexpected message {:?}", other),
    }

    let missing = master.send_full_configuration(node("n9")).await;
    assert!(matches!(
        missing,
        Err(structural_master::Error::UnknownMember(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_abandons_pending() {
    let master = StructuralMaster::start(
        config(2, 10),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();

    let (tx, rx) = oneshot::channel();
    master
        .propagate_and_apply(join("n4"), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    master.close().await;
    assert_eq!(rx.await.unwrap(), Outcome::Abandoned(LogId::new(0)));
}

#[tokio::test(start_paused = true)]
async fn test_lock_timeout_replies_to_remote_submitter() {
    let log = Arc::new(MemoryOperationLog::new());
    let locks = Arc::new(MemoryLockManager::new(
        Duration::from_millis(100),
        Duration::from_secs(60),
    ));
    let master = StructuralMaster::start_with_locks(
        config(2, 10),
        log.clone(),
        Arc::new(MemoryConfigurationStore::default()),
        locks.clone(),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1", "n2"]);

    let _held = locks.lock_resource(CONFIGURATION_RESOURCE).await.unwrap();
    let operation_id = SessionOperationId::new();
    master
        .receive_submit(
            node("n1"),
            operation_id,
            SubmitRequest::NodeJoin {
                identity: node("n4"),
            },
        )
        .unwrap();

    let reply = inboxes[0].recv().await.unwrap();
    assert_eq!(
        reply,
        MemberMessage::Reply {
            operation_id,
            response: SubmitResponse::NodeJoin {
                success: false,
                error: Error::LockTimeout(CONFIGURATION_RESOURCE.to_string()).to_string()
            }
        }
    );
    assert!(log.is_empty());
    assert!(drain(&mut inboxes[1]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lease_shorter_than_proposal_refused() {
    let result = StructuralMaster::start(
        MasterConfig {
            lock_lease_ms: 500,
            ..config(2, 10)
        },
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test(start_paused = true)]
async fn test_pending_join_keeps_lock_for_whole_budget() {
    let log = Arc::new(MemoryOperationLog::new());
    let master = StructuralMaster::start(
        MasterConfig {
            lock_lease_ms: 5_000,
            ..config(2, 3)
        },
        log.clone(),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1"]);

    let first = master.join(node("n4")).unwrap();
    let second = master.join(node("n4")).unwrap();

    // one member never acks; the first join is pending until its budget runs out
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(log.len(), 1);

    assert_eq!(first.await.unwrap().error(), "Operation timed out");
    let mut id = next_propagate(&mut inboxes[0]).await;
    while id == LogId::new(0) {
        id = next_propagate(&mut inboxes[0]).await;
    }
    assert_eq!(id, LogId::new(1));
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn test_close_answers_submit_waiting_for_lock() {
    let master = StructuralMaster::start(
        config(2, 10),
        Arc::new(MemoryOperationLog::new()),
        Arc::new(MemoryConfigurationStore::default()),
    )
    .unwrap();
    let mut inboxes = connect(&master, &["n1", "n2"]);

    let pending = master.join(node("n4")).unwrap();
    next_propagate(&mut inboxes[0]).await;

    let operation_id = SessionOperationId::new();
    master
        .receive_submit(
            node("n1"),
            operation_id,
            SubmitRequest::DropDatabase {
                name: "orders".into(),
            },
        )
        .unwrap();
    master.close().await;

    assert_eq!(pending.await.unwrap().error(), "Operation timed out");
    let replies: Vec<_> = drain(&mut inboxes[0])
        .into_iter()
        .filter(|m| matches!(m, MemberMessage::Reply { .. }))
        .collect();
    assert_eq!(
        replies,
        vec![MemberMessage::Reply {
            operation_id,
            response: SubmitResponse::DropDatabase {
                success: false,
                error: Error::Shutdown.to_string()
            }
        }]
    );
}
