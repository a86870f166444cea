//! Example: issuing a ticket and scanning it at the door
//!
//! Run with: cargo run --example issue_and_check_in

use std::sync::Arc;
use ticket_core::{
    AdmitResult, KeyRing, MemoryStore, RecordingNotifier, SigningKey, TicketConfig, TicketService, Timestamp,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🎟️  Signed Tickets - Example Usage\n");
    println!("==================================\n");

    // Step 1: Keys. In production these come from TICKET_SIGNING_KEY.
    println!("1️⃣  Generating signing key...");
    let config = TicketConfig::new(KeyRing::new(SigningKey::generate()))
        .with_share_base_url("https://tickets.example.com");
    println!("   ✓ Active key id: {}\n", config.keys.active().key_id());

    // Step 2: A registration, as the signup flow would leave it.
    println!("2️⃣  Registering attendee...");
    let store = Arc::new(MemoryStore::new());
    store.register("REG-0001", "EVT-2025-RUSTCONF", "ATT-42")?;
    let notifier = Arc::new(RecordingNotifier::new());
    let service = TicketService::new(config, store).with_notifier(notifier.clone());
    println!("   ✓ REG-0001 created\n");

    // Step 3: Issue.
    println!("3️⃣  Issuing ticket...");
    let issued = service
        .issue("EVT-2025-RUSTCONF".into(), "ATT-42".into(), "REG-0001".into(), Timestamp::now())
        .await?;
    println!("   ✓ Token: {}", issued.token);
    println!("   ✓ Share link: {}", issued.share_link);
    println!("   ✓ Notices sent: {}\n", notifier.sent().len());

    // Step 4: Scan twice.
    println!("4️⃣  Scanning at the door...");
    let scan = issued.token.as_str().as_bytes();
    let first = service.check_in(scan).await?;
    println!("   First scan:  {}", serde_json::to_string(&first)?);
    let second = service.check_in(scan).await?;
    println!("   Second scan: {}\n", serde_json::to_string(&second)?);
    anyhow::ensure!(first.is_ok() && second.is_ok(), "genuine ticket was rejected");

    // Step 5: A forged ticket.
    println!("5️⃣  Scanning a tampered ticket...");
    let mut forged = issued.token.as_str().to_string();
    let last = if forged.ends_with('A') { 'B' } else { 'A' };
    forged.pop();
    forged.push(last);
    let rejected = service.check_in(forged.as_bytes()).await?;
    println!("   Tampered scan: {}", serde_json::to_string(&rejected)?);
    println!(
        "   Verifier accepts it: {}\n",
        service.verifier().verify_token(&forged).is_ok()
    );

    // Step 6: The gate on its own, for a ticket already admitted.
    println!("6️⃣  Asking the gate directly...");
    match service.gate().admit(&"REG-0001".into(), Timestamp::now()).await? {
        AdmitResult::AlreadyAdmitted { admitted_at } => {
            println!("   ✓ Already admitted at {admitted_at}\n");
        }
        other => println!("   ✗ Unexpected result: {other:?}\n"),
    }

    println!("✅ Done");
    Ok(())
}
