use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use meridian_core::packets::{AgentData, CompletePingCheck, GenericMessage, StartPingCheck};
use meridian_core::wire::{PacketType, ThrottleCategory};
use meridian_services::{
    dispatch, DispatchOutcome, GenericMethod, GlobalHandlers, InboundPacket, PacketMethod,
};

use crate::*;

fn ping() -> InboundPacket {
    InboundPacket::from_body(&StartPingCheck {
        ping_id: 3,
        oldest_unacked: 0,
    })
}

fn counting(counter: &Arc<AtomicUsize>) -> PacketMethod {
    let counter = counter.clone();
    Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    })
}

#[test]
fn local_handler_shadows_global() {
    let conn = connection();
    let globals = GlobalHandlers::new();
    let global_hits = Arc::new(AtomicUsize::new(0));
    let local_hits = Arc::new(AtomicUsize::new(0));

    globals.register(PacketType::StartPingCheck, counting(&global_hits));
    assert_eq!(dispatch(&conn, &globals, ping()), DispatchOutcome::Inline(true));
    assert_eq!(global_hits.load(Ordering::SeqCst), 1);

    conn.handlers
        .register(PacketType::StartPingCheck, counting(&local_hits), false);
    dispatch(&conn, &globals, ping());
    assert_eq!(global_hits.load(Ordering::SeqCst), 1);
    assert_eq!(local_hits.load(Ordering::SeqCst), 1);

    conn.handlers.remove(PacketType::StartPingCheck);
    dispatch(&conn, &globals, ping());
    assert_eq!(global_hits.load(Ordering::SeqCst), 2);
}

#[test]
fn first_registration_wins() {
    let globals = GlobalHandlers::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    assert!(globals.register(PacketType::StartPingCheck, counting(&first)));
    assert!(!globals.register(PacketType::StartPingCheck, counting(&second)));

    dispatch(&connection(), &globals, ping());
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_handlers_do_not_escape() {
    let conn = connection();
    let globals = GlobalHandlers::new();

    let panicking: PacketMethod = Arc::new(|_, _| panic!("handler bug"));
    conn.handlers.register(PacketType::StartPingCheck, panicking, false);
    assert!(dispatch(&conn, &globals, ping()).is_handled());

    let failing: PacketMethod = Arc::new(|_, _| anyhow::bail!("bad state"));
    conn.handlers.register(PacketType::CompletePingCheck, failing, false);
    let outcome = dispatch(
        &conn,
        &globals,
        InboundPacket::from_body(&CompletePingCheck { ping_id: 1 }),
    );
    assert!(outcome.is_handled());
}

#[test]
fn unknown_packet_is_unhandled() {
    let outcome = dispatch(&connection(), &GlobalHandlers::new(), ping());
    assert_eq!(outcome, DispatchOutcome::Unhandled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_handler_runs_off_the_receive_path() {
    let conn = connection();
    let done = Arc::new(Notify::new());
    let signal = done.clone();
    let method: PacketMethod = Arc::new(move |conn, packet| {
        let ping = packet.decode::<StartPingCheck>()?;
        conn.send(&CompletePingCheck { ping_id: ping.ping_id }, ThrottleCategory::Resend);
        signal.notify_one();
        Ok(true)
    });
    conn.handlers.register(PacketType::StartPingCheck, method, true);

    let outcome = dispatch(&conn, &GlobalHandlers::new(), ping());
    assert_eq!(outcome, DispatchOutcome::Spawned);
    tokio::time::timeout(Duration::from_secs(5), done.notified())
        .await
        .unwrap();

    let packets = sent(&conn);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::CompletePingCheck);
}

#[test]
fn generic_methods_match_case_insensitively() {
    let conn = connection();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let method: GenericMethod = Arc::new(move |_, message| {
        assert_eq!(message.params.len(), 2);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(conn.handlers.register_generic("  EstateChangeInfo ", method));

    let message = GenericMessage {
        agent: AgentData {
            agent_id: AGENT,
            session_id: SESSION,
        },
        method: "estatechangeinfo".into(),
        invoice: [0; 16],
        params: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
    };
    assert!(conn.handlers.dispatch_generic(&conn, &message));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let unknown = GenericMessage {
        method: "telehub".into(),
        ..message
    };
    assert!(!conn.handlers.dispatch_generic(&conn, &unknown));
}

#[test]
fn closing_clears_handlers() {
    let conn = connection();
    conn.handlers
        .register(PacketType::StartPingCheck, counting(&Arc::new(AtomicUsize::new(0))), false);
    conn.close();
    assert!(conn.handlers.is_empty());
    assert_eq!(
        dispatch(&conn, &GlobalHandlers::new(), ping()),
        DispatchOutcome::Unhandled
    );
}
