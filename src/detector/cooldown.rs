use std::collections::HashMap;

use crate::types::SignalKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub market_id: String,
    pub token_id: String,
    pub signal: SignalKind,
}

/// Anti-spam gate per (market, token, signal). Only an actual emission
/// restarts the cooldown; suppressed occurrences leave it untouched.
#[derive(Debug, Default)]
pub struct Cooldowns {
    cooldown_ms: i64,
    last_fired: HashMap<CooldownKey, i64>,
}

impl Cooldowns {
    pub fn new(cooldown_sec: u64) -> Self {
        Self { cooldown_ms: (cooldown_sec as i64) * 1000, last_fired: HashMap::new() }
    }

    /// Returns true and records the emission when the key is not cooling down.
    pub fn try_fire(&mut self, key: CooldownKey, now_ms: i64) -> bool {
        match self.last_fired.get(&key) {
            Some(&last) if now_ms - last < self.cooldown_ms => false,
            _ => {
                self.last_fired.insert(key, now_ms);
                true
            }
        }
    }

    /// Drops state for tokens no longer monitored.
    pub fn retain_tokens<F: Fn(&str) -> bool>(&mut self, keep: F) {
        self.last_fired.retain(|k, _| keep(&k.token_id));
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }
}
