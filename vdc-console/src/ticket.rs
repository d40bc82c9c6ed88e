//! One-time console access tickets.
//!
//! The serial-console endpoint mints a short-lived ticket; the WebSocket
//! endpoint redeems it exactly once. This stands in for the outer
//! authentication layer, which is outside the core.

use std::collections::HashMap;
use std::sync::Mutex;

use vdc_api_types::Ulid;

/// Ticket lifetime in seconds.
pub const TICKET_LIFETIME_SECS: i64 = 60;

struct TicketEntry {
    vm: Ulid,
    expires_at: i64,
}

#[derive(Default)]
pub struct TicketRegistry {
    tickets: Mutex<HashMap<String, TicketEntry>>,
}

impl TicketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a ticket for a VM's console.
    pub fn mint(&self, vm: Ulid, now: i64) -> String {
        let mut raw = [0u8; 16];
        openssl::rand::rand_bytes(&mut raw).expect("entropy source unavailable");
        let token: String = raw.iter().map(|b| format!("{b:02x}")).collect();

        let mut tickets = self.tickets.lock().unwrap();
        tickets.retain(|_, entry| entry.expires_at > now);
        tickets.insert(
            token.clone(),
            TicketEntry {
                vm,
                expires_at: now + TICKET_LIFETIME_SECS,
            },
        );
        token
    }

    /// Redeem a ticket; single use.
    pub fn redeem(&self, token: &str, now: i64) -> Option<Ulid> {
        let mut tickets = self.tickets.lock().unwrap();
        let entry = tickets.remove(token)?;
        if entry.expires_at <= now {
            return None;
        }
        Some(entry.vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_are_single_use() {
        let registry = TicketRegistry::new();
        let vm = Ulid::generate();
        let token = registry.mint(vm, 1000);

        assert_eq!(registry.redeem(&token, 1001), Some(vm));
        assert_eq!(registry.redeem(&token, 1001), None);
    }

    #[test]
    fn tickets_expire() {
        let registry = TicketRegistry::new();
        let vm = Ulid::generate();
        let token = registry.mint(vm, 1000);

        assert_eq!(registry.redeem(&token, 1000 + TICKET_LIFETIME_SECS + 1), None);
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        let registry = TicketRegistry::new();
        assert_eq!(registry.redeem("deadbeef", 0), None);
    }
}
