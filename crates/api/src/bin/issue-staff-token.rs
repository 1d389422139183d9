#!/usr/bin/env cargo
//! Staff token utility for deskchat
//!
//! Mints a staff JWT signed with `JWT_SECRET` for local testing. Production
//! tokens come from the deployment's identity provider.
//!
//! Usage:
//!   cargo run --bin issue-staff-token -- <username> [display name] [permission ...]
//!   cargo run --bin issue-staff-token -- alice "Alice Smith" chat.handle chat.supervise
//!
//! With no permissions given, the token carries `chat.handle`.

use deskchat_api::auth::{JwtManager, PERMISSION_CHAT_HANDLE};
use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let mut args = env::args().skip(1);
    let Some(username) = args.next() else {
        eprintln!("Usage: issue-staff-token <username> [display name] [permission ...]");
        std::process::exit(1);
    };
    let display_name = args.next().unwrap_or_else(|| username.clone());
    let mut permissions: Vec<String> = args.collect();
    if permissions.is_empty() {
        permissions.push(PERMISSION_CHAT_HANDLE.to_string());
    }

    let secret = env::var("JWT_SECRET").map_err(|_| "JWT_SECRET must be set")?;
    if secret.len() < 32 {
        eprintln!("Warning: JWT_SECRET is shorter than 32 characters; the server will refuse it.");
    }
    let expiry_hours: i64 = env::var("STAFF_TOKEN_EXPIRY_HOURS")
        .ok()
        .and_then(|h| h.parse().ok())
        .unwrap_or(12);

    let permission_refs: Vec<&str> = permissions.iter().map(String::as_str).collect();
    let token = JwtManager::new(&secret, expiry_hours).generate_staff_token(
        &username,
        &display_name,
        &permission_refs,
    )?;

    println!("\n===========================================");
    println!("Staff token for {username} ({})", permissions.join(", "));
    println!("===========================================");
    println!("{token}");
    println!("===========================================\n");

    println!("Usage:");
    println!("  curl -H 'Authorization: Bearer <token>' http://localhost:3000/api/staff/me");
    println!("  ws://localhost:3000/ws/staff?token=<token>");

    Ok(())
}
