/*
    rdb  -  a distributed reversible debugger for MPI programs
    Copyright (C) 2023  Matt Kimball

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

//! End-to-end send/receive matching and rollback, driven through the real
//! `rdb-orchestrator`/`rdb-tracer` binaries and the UI websocket, rather
//! than the in-process `CheckpointGraph`/`RollbackPlanner` unit tests.

use anyhow::{anyhow, Result};
use rdb_proto::model::{CheckpointRecord, NodeId};
use rdb_proto::rpc::UiMessage;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

fn node_by_rank(
    snapshot: &BTreeMap<NodeId, Vec<CheckpointRecord>>,
    rank: i64,
) -> Option<NodeId> {
    snapshot
        .iter()
        .find(|(_, records)| records.iter().any(|r| r.node_rank == Some(rank)))
        .map(|(node, _)| *node)
}

fn find_op<'a>(
    records: &'a [CheckpointRecord],
    op_name: &str,
) -> Option<&'a CheckpointRecord> {
    records.iter().find(|r| r.op_name == op_name)
}

#[tokio::test]
async fn send_receive_match_and_roll_back() -> Result<()> {
    let rpc_addr: SocketAddr = "127.0.0.1:19500".parse().unwrap();
    let ui_addr: SocketAddr = "127.0.0.1:19501".parse().unwrap();
    let node0_listen: SocketAddr = "127.0.0.1:19510".parse().unwrap();
    let node1_listen: SocketAddr = "127.0.0.1:19511".parse().unwrap();

    let binary = integration_test::compile_tracee("send_recv.c")?;
    let _orchestrator = integration_test::Orchestrator::spawn(rpc_addr, ui_addr)?;

    let (_node_a, _, _) =
        integration_test::Node::spawn(&binary, &["0"], rpc_addr, node0_listen, false)?;
    let (_node_b, _, _) =
        integration_test::Node::spawn(&binary, &["1"], rpc_addr, node1_listen, false)?;

    let mut ws = integration_test::connect_ui(ui_addr).await?;

    let matched = integration_test::wait_for_ui_message(
        &mut ws,
        Duration::from_secs(10),
        |message| match message {
            UiMessage::CheckpointUpdate(snapshot) => snapshot
                .values()
                .flatten()
                .any(|r| r.op_name == "MPI_Send" && r.matching_event_id.is_some()),
            _ => false,
        },
    )
    .await?;

    let snapshot = match matched {
        UiMessage::CheckpointUpdate(snapshot) => snapshot,
        _ => unreachable!(),
    };

    let sender = node_by_rank(&snapshot, 0).ok_or_else(|| anyhow!("rank 0 not seen yet"))?;
    let receiver = node_by_rank(&snapshot, 1).ok_or_else(|| anyhow!("rank 1 not seen yet"))?;

    let send_record = find_op(&snapshot[&sender], "MPI_Send").ok_or_else(|| anyhow!("no send"))?;
    let recv_record = find_op(&snapshot[&receiver], "MPI_Recv").ok_or_else(|| anyhow!("no recv"))?;
    assert_eq!(send_record.matching_event_id, Some(recv_record.id.clone()));
    assert_eq!(recv_record.matching_event_id, Some(send_record.id.clone()));

    let target = send_record.id.clone();
    integration_test::send_ui_message(&mut ws, &UiMessage::RollbackSubmit(target.clone())).await?;

    let confirm = integration_test::wait_for_ui_message(
        &mut ws,
        Duration::from_secs(5),
        |message| matches!(message, UiMessage::RollbackConfirm(_)),
    )
    .await?;
    let plan = match confirm {
        UiMessage::RollbackConfirm(plan) => plan,
        _ => unreachable!(),
    };

    // Rolling back the send must pull in the receiver too, since it is the
    // send's causal pair: both logs roll back to just after their own half
    // of the matched message, not further.
    assert_eq!(plan.get(sender), Some(&target));
    assert_eq!(plan.get(receiver), Some(&recv_record.id));

    integration_test::send_ui_message(&mut ws, &UiMessage::RollbackCommit(true)).await?;

    let result = integration_test::wait_for_ui_message(
        &mut ws,
        Duration::from_secs(5),
        |message| matches!(message, UiMessage::RollbackResult(_)),
    )
    .await?;
    let after = match result {
        UiMessage::RollbackResult(snapshot) => snapshot,
        _ => unreachable!(),
    };

    // Both logs now end at their own half of the matched message; whatever
    // came after (the closing barrier) was discarded on both sides, and
    // the stale cross-node link is cleared now that it no longer holds.
    let sender_tail = after[&sender].last().expect("sender log non-empty");
    assert_eq!(sender_tail.id, target);
    assert!(sender_tail.current_location);
    assert!(sender_tail.matching_event_id.is_none());

    let receiver_tail = after[&receiver].last().expect("receiver log non-empty");
    assert_eq!(receiver_tail.id, recv_record.id);
    assert!(receiver_tail.current_location);
    assert!(receiver_tail.matching_event_id.is_none());

    Ok(())
}
