//! Test Transaction Producer
//!
//! Publishes synthetic transactions for 100 simulated users to NATS. Every
//! 20th transaction is anomalous and carries the ground-truth flag.

use anomaly_stream_detector::types::{Device, Merchant, Transaction};
use chrono::{Timelike, Utc};
use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

const USERS: i64 = 100;
const ANOMALY_EVERY: u64 = 20;

const LOCATIONS: &[&str] = &["US", "IN", "UK", "CA", "AU", "JP", "DE", "FR", "BR", "SG"];
const RISKY_LOCATIONS: &[&str] = &["RU", "NG", "CN", "MX", "ZA"];
const MERCHANT_CATEGORIES: &[&str] = &[
    "Retail",
    "Restaurant",
    "Travel",
    "Entertainment",
    "Grocery",
    "Electronics",
    "Healthcare",
    "Utilities",
    "Education",
    "Other",
];
const PAYMENT_METHODS: &[&str] = &[
    "Credit Card",
    "Debit Card",
    "Bank Transfer",
    "Digital Wallet",
    "Cryptocurrency",
];
const DEVICE_TYPES: &[&str] = &["Mobile", "Desktop", "Tablet", "ATM", "POS Terminal"];
const TRANSACTION_TYPES: &[&str] = &["purchase", "withdrawal", "refund", "transfer", "payment", "deposit"];

/// Simulated spending habits of one user
struct Persona {
    locations: Vec<&'static str>,
    merchants: Vec<&'static str>,
    min_amount: f64,
    max_amount: f64,
    payment_methods: Vec<&'static str>,
    hours: Vec<u32>,
}

impl Persona {
    fn random(rng: &mut ThreadRng) -> Self {
        let pick = |rng: &mut ThreadRng, from: &[&'static str], lo: usize, hi: usize| {
            let k = rng.gen_range(lo..=hi);
            from.choose_multiple(rng, k).copied().collect::<Vec<_>>()
        };

        Self {
            locations: pick(rng, LOCATIONS, 1, 3),
            merchants: pick(rng, MERCHANT_CATEGORIES, 2, 5),
            min_amount: rng.gen_range(5.0..200.0),
            max_amount: rng.gen_range(300.0..2000.0),
            payment_methods: pick(rng, PAYMENT_METHODS, 1, 3),
            hours: (0..rng.gen_range(3..=8)).map(|_| rng.gen_range(8..=22)).collect(),
        }
    }
}

/// Transaction generator for testing
struct TransactionGenerator {
    rng: ThreadRng,
    /// Indexed by user id - 1
    personas: Vec<Persona>,
    transaction_counter: u64,
}

impl TransactionGenerator {
    fn new() -> Self {
        let mut rng = rand::thread_rng();
        let personas = (0..USERS).map(|_| Persona::random(&mut rng)).collect();
        Self {
            rng,
            personas,
            transaction_counter: 0,
        }
    }

    fn generate(&mut self) -> Transaction {
        let anomalous = self.transaction_counter % ANOMALY_EVERY == 0;
        self.transaction_counter += 1;

        let index = self.rng.gen_range(0..self.personas.len());
        let user_id = index as i64 + 1;
        let persona = &self.personas[index];
        let rng = &mut self.rng;

        let now = Utc::now();
        let (location, amount, category, payment_method, timestamp) = if anomalous {
            let unusual: Vec<&str> = MERCHANT_CATEGORIES
                .iter()
                .copied()
                .filter(|c| !persona.merchants.contains(c))
                .collect();
            (
                choose(rng, RISKY_LOCATIONS),
                rng.gen_range(3000.0..10000.0),
                choose(rng, &unusual),
                choose(rng, PAYMENT_METHODS),
                now.timestamp() as f64,
            )
        } else {
            // Shift the event into one of the user's usual hours
            let hour = persona.hours.choose(rng).copied().unwrap_or(12);
            let shift = (hour as i64 - now.hour() as i64) * 3600;
            (
                choose(rng, &persona.locations),
                rng.gen_range(persona.min_amount..persona.max_amount),
                choose(rng, &persona.merchants),
                choose(rng, &persona.payment_methods),
                (now.timestamp() + shift) as f64,
            )
        };

        let mut transaction = Transaction::new(
            uuid::Uuid::new_v4().to_string(),
            user_id,
            (amount * 100.0).round() / 100.0,
            timestamp,
        );
        transaction.location = location.to_string();
        transaction.transaction_type = choose(rng, TRANSACTION_TYPES).to_string();
        transaction.merchant = Merchant {
            merchant_id: format!("MERCH{}", rng.gen_range(1000..10000)),
            name: format!("{}_{}", category, rng.gen_range(100..1000)),
            category: category.to_string(),
        };
        transaction.payment_method = payment_method.to_string();
        transaction.device = Device {
            device_type: choose(rng, DEVICE_TYPES).to_string(),
            ip_address: format!(
                "192.168.{}.{}",
                rng.gen_range(1..=255),
                rng.gen_range(1..=255)
            ),
        };
        transaction.is_anomalous = Some(anomalous);
        transaction
    }
}

fn choose<'a>(rng: &mut ThreadRng, choices: &[&'a str]) -> &'a str {
    choices.choose(rng).copied().unwrap_or("Other")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Transaction Producer");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let subject = args.get(2).map(|s| s.as_str()).unwrap_or("transactions");
    let count: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(200);
    let delay_ms: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        subject = %subject,
        count,
        delay_ms,
        "Configuration loaded"
    );

    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, delay_ms).await;
        }
    };

    let mut generator = TransactionGenerator::new();
    let mut anomalous_count = 0;

    for i in 0..count {
        let transaction = generator.generate();
        if transaction.is_confirmed_anomaly() {
            anomalous_count += 1;
        }

        let payload = serde_json::to_vec(&transaction)?;
        client.publish(subject.to_string(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                published = i + 1,
                total = count,
                anomalous = anomalous_count,
                "Publishing transactions"
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    client.flush().await?;

    info!(count, anomalous = anomalous_count, "Completed");
    Ok(())
}

async fn run_dry_mode(count: u64, delay_ms: u64) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = TransactionGenerator::new();
    for i in 0..count {
        let transaction = generator.generate();
        let json = serde_json::to_string_pretty(&transaction)?;

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample transaction {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
