//! End-to-end login flow against a real backend.
//!
//! Set `KENEYA_API_URL` (a `.env` file works) and run:
//! `cargo run --example login_flow`

use std::io::{self, Write};
use std::sync::Arc;

use keneya_client::{ApiClient, FileStore};

fn prompt(label: &str) -> io::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keneya_client=debug".into()),
        )
        .init();

    let store = Arc::new(FileStore::open("keneya-session.json").await?);
    let client = ApiClient::from_env(store).await?;

    if client.is_authenticated().await {
        let patient = client.current_patient().await;
        println!(
            "Already logged in as {}",
            patient
                .map(|p| p.user.first_name)
                .unwrap_or_else(|| "<unknown>".into())
        );
    } else {
        let phone = prompt("Phone number")?;
        client.request_otp(&phone).await?;
        println!("Code sent by SMS.");

        let code = prompt("Code")?;
        let patient = client.verify_otp(&phone, &code).await?;
        println!("Bonjour {} {}", patient.user.first_name, patient.user.last_name);
    }

    // Authenticated call; an expired access token heals transparently.
    if let Some(patient) = client.current_patient().await {
        let appointments = client.get_patient_appointments(&patient.id).await?;
        println!("{} upcoming appointment(s)", appointments.len());
        for appointment in appointments {
            println!(
                "  {} {}-{} ({:?})",
                appointment.date,
                appointment.start_time,
                appointment.end_time,
                appointment.status
            );
        }
    }

    Ok(())
}
