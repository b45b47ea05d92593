use std::io::{IsTerminal, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct EventOutput<'a> {
    kind: &'a str,
    peer_id: Option<&'a str>,
    payload: &'a Value,
    timestamp: String,
}

/// Print one received message, request or response.
pub fn print_event(kind: &str, peer_id: Option<&str>, payload: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EventOutput {
                kind,
                peer_id,
                payload,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "PEER", "PAYLOAD"])
                .add_row(vec![
                    kind.to_string(),
                    peer_id.unwrap_or("-").to_string(),
                    payload.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{kind} peer={} payload={}",
                peer_id.unwrap_or("-"),
                serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

#[derive(Serialize)]
struct PingOutput<'a> {
    peer_id: Option<&'a str>,
    samples_ms: Vec<f64>,
    avg_ms: f64,
}

pub fn print_pings(peer_id: Option<&str>, samples: &[Duration], format: OutputFormat) {
    let samples_ms: Vec<f64> = samples.iter().copied().map(millis).collect();
    let avg_ms = if samples_ms.is_empty() {
        0.0
    } else {
        round2(samples_ms.iter().sum::<f64>() / samples_ms.len() as f64)
    };

    match format {
        OutputFormat::Json => {
            let out = PingOutput {
                peer_id,
                samples_ms,
                avg_ms,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "RTT (ms)"]);
            for (seq, rtt) in samples_ms.iter().enumerate() {
                table.add_row(vec![(seq + 1).to_string(), format!("{rtt:.2}")]);
            }
            table.add_row(vec!["avg".to_string(), format!("{avg_ms:.2}")]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (seq, rtt) in samples_ms.iter().enumerate() {
                println!("seq={} peer={} rtt={rtt:.2}ms", seq + 1, peer_id.unwrap_or("-"));
            }
            println!("avg={avg_ms:.2}ms");
        }
        OutputFormat::Raw => println!("{avg_ms}"),
    }
}

/// Strings print bare, anything else as compact JSON.
pub fn print_raw(payload: &Value) {
    let mut out = std::io::stdout();
    let _ = match payload {
        Value::String(text) => writeln!(out, "{text}"),
        other => writeln!(out, "{other}"),
    };
    let _ = out.flush();
}

fn millis(duration: Duration) -> f64 {
    round2(duration.as_secs_f64() * 1000.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
