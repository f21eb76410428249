//! End-to-end actor scenarios: deterministic ping/pong, request timeouts,
//! and linked failure propagation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use rook::{
    behavior, ActorSystem, ActorSystemConfig, ErrorCode, ExitReason, Message, Registry, Reply,
    TypeTag,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Ping(i64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Pong(i64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Boom;

static BOOT: Once = Once::new();

fn boot() {
    BOOT.call_once(|| {
        let mut registry = Registry::with_builtins();
        registry
            .add::<Ping>(TypeTag(TypeTag::FIRST_USER_ID), "ping")
            .unwrap();
        registry
            .add::<Pong>(TypeTag(TypeTag::FIRST_USER_ID + 1), "pong")
            .unwrap();
        registry
            .add::<Boom>(TypeTag(TypeTag::FIRST_USER_ID + 2), "boom")
            .unwrap();
        registry.install().unwrap();
    });
}

fn system() -> ActorSystem {
    boot();
    let mut config = ActorSystemConfig::default();
    config.scheduler.max_threads = 2;
    ActorSystem::new(config).unwrap()
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn ping_pong_is_deterministic() {
    let system = system();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let q_log = log.clone();
    let q = system
        .spawn("q", move |_ctx| {
            behavior()
                .handle(move |ctx, Ping(n): Ping| {
                    q_log.lock().unwrap().push(format!("ping {n}"));
                    if let Some(sender) = ctx.sender() {
                        ctx.send(&sender, Message::of(Pong(n)).unwrap());
                    }
                    Reply::unit()
                })
                .build()
        })
        .unwrap();

    let p_log = log.clone();
    let q_for_p = q.clone();
    let p = system
        .spawn("p", move |ctx| {
            let target = q_for_p.clone();
            ctx.send(&target, Message::of(Ping(3)).unwrap());
            let reply_target = target.clone();
            behavior()
                .handle(move |ctx, Pong(n): Pong| {
                    p_log.lock().unwrap().push(format!("pong {n}"));
                    if n > 1 {
                        ctx.send(&reply_target, Message::of(Ping(n - 1)).unwrap());
                    }
                    Reply::unit()
                })
                .build()
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || log
        .lock()
        .unwrap()
        .len()
        == 6));
    assert!(system.await_idle(Duration::from_secs(2)));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["ping 3", "pong 3", "ping 2", "pong 2", "ping 1", "pong 1"]
    );
    // Both mailboxes drained completely.
    assert_eq!(p.pending_messages(), 0);
    assert_eq!(q.pending_messages(), 0);
    system.shutdown();
}

#[test]
fn request_timeout_fires_exactly_once() {
    let system = system();
    // B matches the request but never responds.
    let b = system
        .spawn("b", |_ctx| {
            behavior()
                .handle2(|_ctx, _a: i64, _b: i64| Reply::unit())
                .build()
        })
        .unwrap();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let timeouts_in = timeouts.clone();
    let successes_in = successes.clone();
    let _a = system
        .spawn("a", move |ctx| {
            let timeouts = timeouts_in.clone();
            let successes = successes_in.clone();
            ctx.request(
                &b,
                Duration::from_millis(10),
                Message::of2(1i64, 2i64).unwrap(),
            )
            .then(
                move |_ctx, _msg| {
                    successes.fetch_add(1, Ordering::SeqCst);
                },
                move |_ctx, err| {
                    assert_eq!(err.code(), ErrorCode::RequestTimeout);
                    timeouts.fetch_add(1, Ordering::SeqCst);
                },
            );
            behavior().handle(|_ctx, _p: Ping| Reply::unit()).build()
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        timeouts.load(Ordering::SeqCst) == 1
    }));
    // Give a late duplicate every chance to show up.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(successes.load(Ordering::SeqCst), 0);
    system.shutdown();
}

#[test]
fn linked_failure_propagates_non_normal_exits() {
    let system = system();
    let b = system
        .spawn("bomb", |_ctx| {
            behavior()
                .handle(|ctx, _b: Boom| {
                    ctx.quit(ExitReason::User {
                        code: 42,
                        message: "boom".into(),
                    });
                    Reply::unit()
                })
                .build()
        })
        .unwrap();

    let b_for_a = b.clone();
    let a = system
        .spawn("buddy", move |ctx| {
            ctx.link(&b_for_a);
            behavior().handle(|_ctx, _p: Ping| Reply::unit()).build()
        })
        .unwrap();

    system.send(&b, Message::of(Boom).unwrap()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || !a.is_alive()));
    let expected = ExitReason::User {
        code: 42,
        message: "boom".into(),
    };
    assert_eq!(b.exit_reason(), Some(expected.clone()));
    // The exit reason arrived through the link unchanged.
    assert_eq!(a.exit_reason(), Some(expected));
    system.shutdown();
}

#[test]
fn normal_exits_do_not_propagate_through_links() {
    let system = system();
    let b = system
        .spawn("quitter", |_ctx| {
            behavior()
                .handle(|ctx, _b: Boom| {
                    ctx.quit(ExitReason::Normal);
                    Reply::unit()
                })
                .build()
        })
        .unwrap();
    let b_for_a = b.clone();
    let a = system
        .spawn("survivor", move |ctx| {
            ctx.link(&b_for_a);
            behavior().handle(|_ctx, _p: Ping| Reply::unit()).build()
        })
        .unwrap();
    system.send(&b, Message::of(Boom).unwrap()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !b.is_alive()));
    std::thread::sleep(Duration::from_millis(50));
    assert!(a.is_alive());
    system.shutdown();
}

#[test]
fn monitors_receive_down_messages() {
    let system = system();
    let b = system
        .spawn("watched", |_ctx| {
            behavior()
                .handle(|ctx, _b: Boom| {
                    ctx.quit(ExitReason::Normal);
                    Reply::unit()
                })
                .build()
        })
        .unwrap();

    let downs = Arc::new(AtomicUsize::new(0));
    let downs_in = downs.clone();
    let b_for_w = b.clone();
    let _w = system
        .spawn("watcher", move |ctx| {
            ctx.monitor(&b_for_w);
            let downs = downs_in.clone();
            behavior()
                .handle(move |_ctx, msg: rook::DownMsg| {
                    assert_eq!(msg.reason, ExitReason::Normal);
                    downs.fetch_add(1, Ordering::SeqCst);
                    Reply::unit()
                })
                .build()
        })
        .unwrap();

    system.send(&b, Message::of(Boom).unwrap()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        downs.load(Ordering::SeqCst) == 1
    }));
    system.shutdown();
}
