//! Anthropic dual-key failover state.
//!
//! The Anthropic provider can hold two independent credentials: a setup
//! token and an enterprise key. A 429/401 on one key puts that key type on a
//! cooldown; while it cools, the other key becomes primary with no fallback.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const KEY_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
	SetupToken,
	Enterprise,
}

impl KeyType {
	pub fn as_str(&self) -> &'static str {
		match self {
			KeyType::SetupToken => "setup-token",
			KeyType::Enterprise => "enterprise",
		}
	}

	fn other(&self) -> KeyType {
		match self {
			KeyType::SetupToken => KeyType::Enterprise,
			KeyType::Enterprise => KeyType::SetupToken,
		}
	}
}

impl std::fmt::Display for KeyType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The attempt order for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPlan {
	pub primary: KeyType,
	pub fallback: Option<KeyType>,
}

#[derive(Debug, Default)]
struct Cooldowns {
	setup_token_until: Option<Instant>,
	enterprise_until: Option<Instant>,
}

impl Cooldowns {
	fn cooling(&self, kt: KeyType) -> bool {
		let until = match kt {
			KeyType::SetupToken => self.setup_token_until,
			KeyType::Enterprise => self.enterprise_until,
		};
		until.is_some_and(|t| t > Instant::now())
	}
}

#[derive(Debug, Clone, Default)]
pub struct DualKeyState {
	inner: Arc<Mutex<Cooldowns>>,
}

impl DualKeyState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pick the attempt order given which credentials exist and which are
	/// cooling. `None` when every available key type is on cooldown.
	pub fn plan(
		&self,
		have_setup_token: bool,
		have_enterprise: bool,
		prefer_setup_token: bool,
	) -> Option<KeyPlan> {
		let cooldowns = self.inner.lock().expect("dual key lock");
		let available = |kt: KeyType| {
			let have = match kt {
				KeyType::SetupToken => have_setup_token,
				KeyType::Enterprise => have_enterprise,
			};
			have && !cooldowns.cooling(kt)
		};
		let preferred = if prefer_setup_token {
			KeyType::SetupToken
		} else {
			KeyType::Enterprise
		};
		match (available(preferred), available(preferred.other())) {
			(true, true) => Some(KeyPlan {
				primary: preferred,
				fallback: Some(preferred.other()),
			}),
			(true, false) => Some(KeyPlan {
				primary: preferred,
				fallback: None,
			}),
			(false, true) => Some(KeyPlan {
				primary: preferred.other(),
				fallback: None,
			}),
			(false, false) => None,
		}
	}

	pub fn mark_cooldown(&self, kt: KeyType, cooldown: Duration) {
		let mut cooldowns = self.inner.lock().expect("dual key lock");
		let until = Instant::now() + cooldown;
		match kt {
			KeyType::SetupToken => cooldowns.setup_token_until = Some(until),
			KeyType::Enterprise => cooldowns.enterprise_until = Some(until),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preferred_key_is_primary_with_other_as_fallback() {
		let s = DualKeyState::new();
		assert_eq!(
			s.plan(true, true, true),
			Some(KeyPlan {
				primary: KeyType::SetupToken,
				fallback: Some(KeyType::Enterprise),
			})
		);
		assert_eq!(
			s.plan(true, true, false),
			Some(KeyPlan {
				primary: KeyType::Enterprise,
				fallback: Some(KeyType::SetupToken),
			})
		);
	}

	#[test]
	fn cooling_primary_promotes_the_other_without_fallback() {
		let s = DualKeyState::new();
		s.mark_cooldown(KeyType::SetupToken, Duration::from_secs(60));
		assert_eq!(
			s.plan(true, true, true),
			Some(KeyPlan {
				primary: KeyType::Enterprise,
				fallback: None,
			})
		);
	}

	#[test]
	fn single_credential_has_no_fallback() {
		let s = DualKeyState::new();
		assert_eq!(
			s.plan(false, true, true),
			Some(KeyPlan {
				primary: KeyType::Enterprise,
				fallback: None,
			})
		);
	}

	#[test]
	fn all_keys_cooling_yields_no_plan() {
		let s = DualKeyState::new();
		s.mark_cooldown(KeyType::SetupToken, Duration::from_secs(60));
		s.mark_cooldown(KeyType::Enterprise, Duration::from_secs(60));
		assert_eq!(s.plan(true, true, true), None);
	}

	#[test]
	fn expired_cooldown_restores_the_key() {
		let s = DualKeyState::new();
		s.mark_cooldown(KeyType::SetupToken, Duration::ZERO);
		let plan = s.plan(true, true, true).unwrap();
		assert_eq!(plan.primary, KeyType::SetupToken);
	}
}
