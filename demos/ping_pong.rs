//! Two actors bouncing a counter back and forth.
//!
//! Run with: `cargo run --example ping_pong`

use serde::{Deserialize, Serialize};

use rook::{behavior, logging, ActorSystem, ActorSystemConfig, Message, Registry, Reply, TypeTag};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Ping(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Pong(u64);

fn main() -> anyhow::Result<()> {
    logging::init_default();

    let mut registry = Registry::with_builtins();
    registry.add::<Ping>(TypeTag(TypeTag::FIRST_USER_ID), "ping")?;
    registry.add::<Pong>(TypeTag(TypeTag::FIRST_USER_ID + 1), "pong")?;
    registry.install()?;

    let system = ActorSystem::new(ActorSystemConfig::default())?;

    let pong = system.spawn("pong", |_ctx| {
        behavior()
            .handle(|ctx, Ping(n): Ping| {
                println!("ping {n}");
                if let Some(sender) = ctx.sender() {
                    if let Ok(msg) = Message::of(Pong(n)) {
                        ctx.send(&sender, msg);
                    }
                }
                Reply::unit()
            })
            .build()
    })?;

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    system.spawn("ping", move |ctx| {
        ctx.send(&pong, Message::of(Ping(3))?);
        let target = pong.clone();
        behavior()
            .handle(move |ctx, Pong(n): Pong| {
                println!("pong {n}");
                if n > 1 {
                    if let Ok(msg) = Message::of(Ping(n - 1)) {
                        ctx.send(&target, msg);
                    }
                } else {
                    let _ = done_tx.send(());
                }
                Reply::unit()
            })
            .build()
    })?;

    done_rx.recv()?;
    system.shutdown();
    Ok(())
}
