//! Two devices exchanging messages through the in-process directory and relay
//!
//! Run with `RUST_LOG=secure_session=debug` to see handshake and ratchet events.

use secure_session::logging::init_logging;
use secure_session::{
    InMemoryDirectory, InMemoryStorage, LoopbackNetwork, Result, SendOutcome, SessionAddress,
    SessionConfig, SessionManager,
};
use std::sync::Arc;

const CONFIG: &str = r#"
prekey_low_water = 5
prekey_target = 10
fetch_timeout_ms = 2000
"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging("secure_session=info");
    let config = SessionConfig::from_toml_str(CONFIG)?;

    let directory = Arc::new(InMemoryDirectory::new());
    let network = Arc::new(LoopbackNetwork::new());
    let alice_address = SessionAddress::new("alice", 1);
    let bob_address = SessionAddress::new("bob", 1);
    let mut alice_inbox = network.register(&alice_address)?;
    let mut bob_inbox = network.register(&bob_address)?;

    let alice = SessionManager::open(
        alice_address.clone(),
        Arc::new(InMemoryStorage::new()),
        config.clone(),
        directory.clone(),
        network.clone(),
    )?;
    let bob = SessionManager::open(
        bob_address.clone(),
        Arc::new(InMemoryStorage::new()),
        config,
        directory.clone(),
        network.clone(),
    )?;

    println!("1. Alice sends before Bob has published anything");
    alice.start().await?;
    let outcome = alice.send(&bob_address, b"Are you there?").await?;
    println!("   outcome: {outcome:?}, queued: {}\n", alice.pending_count()?);
    assert_eq!(outcome, SendOutcome::Queued);

    println!("2. Bob comes online and publishes his bundle");
    bob.start().await?;
    println!(
        "   one-time prekeys available: {}\n",
        bob.key_store().one_time_prekey_count()?
    );

    println!("3. Alice flushes her queue");
    let report = alice.flush_pending().await?;
    println!("   delivered: {}, requeued: {}\n", report.delivered, report.requeued);

    println!("4. Bob receives");
    while let Some(envelope) = bob_inbox.try_recv() {
        let envelope = envelope?;
        if let Some(plaintext) = bob.receive(&envelope).await? {
            println!("   from {}: {}", envelope.sender(), String::from_utf8_lossy(&plaintext));
        }
    }
    println!(
        "   one-time prekeys after the handshake: {}\n",
        bob.key_store().one_time_prekey_count()?
    );

    println!("5. Conversation");
    for (round, text) in ["Hello Alice!", "Ratchet turns on every reply", "Bye"]
        .iter()
        .enumerate()
    {
        bob.send(&alice_address, text.as_bytes()).await?;
        if let Some(Ok(envelope)) = alice_inbox.recv().await {
            let plaintext = alice.receive(&envelope).await?.unwrap_or_default();
            println!("   Alice got: {}", String::from_utf8_lossy(&plaintext));
        }

        let reply = format!("ack {round}");
        alice.send(&bob_address, reply.as_bytes()).await?;
        if let Some(Ok(envelope)) = bob_inbox.recv().await {
            let plaintext = bob.receive(&envelope).await?.unwrap_or_default();
            println!("   Bob got:   {}", String::from_utf8_lossy(&plaintext));
        }
    }

    println!("\n6. Status");
    println!("   Alice -> Bob: {:?}", alice.status(&bob_address)?);
    println!("   Bob -> Alice: {:?}", bob.status(&alice_address)?);

    alice.close()?;
    bob.close()?;
    Ok(())
}
