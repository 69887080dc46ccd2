//! Model catalog and routing table.
//!
//! Both are loaded once at startup and immutable afterwards. Every model id
//! referenced by the routing table or the force-model aliases must resolve in
//! the catalog; an unresolved id is a fatal startup error.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classify::Tier;
use crate::config::Mode;
use crate::llm::{ProviderTag, ProxyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
	pub id: String,
	pub display_name: String,
	pub provider: ProviderTag,
	#[serde(rename = "inputCostPerMTok")]
	pub input_cost_per_mtok: f64,
	#[serde(rename = "outputCostPerMTok")]
	pub output_cost_per_mtok: f64,
	pub max_context_tokens: u64,
}

impl ModelSpec {
	/// Blended per-token cost used to order the model hierarchy. Output
	/// tokens dominate real spend, so they are weighted heavier.
	fn blended_cost(&self) -> f64 {
		self.input_cost_per_mtok + 3.0 * self.output_cost_per_mtok
	}

	pub fn estimate_cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
		(input_tokens as f64 * self.input_cost_per_mtok
			+ output_tokens as f64 * self.output_cost_per_mtok)
			/ 1_000_000.0
	}
}

#[derive(Debug, Clone, Deserialize)]
struct Catalog {
	models: Vec<ModelSpec>,
}

/// Ordered model preferences for one mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPrefs {
	pub simple: Vec<String>,
	pub standard: Vec<String>,
	pub complex: Vec<String>,
}

impl TierPrefs {
	fn for_tier(&self, tier: Tier) -> &[String] {
		match tier {
			Tier::Simple => &self.simple,
			Tier::Standard => &self.standard,
			Tier::Complex => &self.complex,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingTable {
	pub eco: TierPrefs,
	pub standard: TierPrefs,
	#[serde(alias = "performance")]
	pub gigachad: TierPrefs,
}

impl RoutingTable {
	pub fn preferences(&self, mode: Mode, tier: Tier) -> &[String] {
		let prefs = match mode {
			Mode::Eco => &self.eco,
			Mode::Standard => &self.standard,
			Mode::Gigachad => &self.gigachad,
		};
		prefs.for_tier(tier)
	}

	fn all_ids(&self) -> impl Iterator<Item = &String> {
		[&self.eco, &self.standard, &self.gigachad]
			.into_iter()
			.flat_map(|p| {
				p.simple
					.iter()
					.chain(p.standard.iter())
					.chain(p.complex.iter())
			})
	}
}

#[derive(Debug)]
pub struct ModelRegistry {
	models: HashMap<String, ModelSpec>,
	/// Catalog ids ordered cheapest to most capable by blended cost.
	hierarchy: Vec<String>,
	table: RoutingTable,
	aliases: HashMap<String, String>,
}

impl ModelRegistry {
	pub fn load(
		catalog_path: &Path,
		table_path: &Path,
		aliases: HashMap<String, String>,
	) -> Result<Self, ProxyError> {
		let raw = std::fs::read_to_string(catalog_path)
			.map_err(|e| ProxyError::Config(format!("model catalog {}: {e}", catalog_path.display())))?;
		let catalog: Catalog = serde_json::from_str(&raw)
			.map_err(|e| ProxyError::Config(format!("model catalog {}: {e}", catalog_path.display())))?;
		let raw = std::fs::read_to_string(table_path)
			.map_err(|e| ProxyError::Config(format!("routing table {}: {e}", table_path.display())))?;
		let table: RoutingTable = serde_json::from_str(&raw)
			.map_err(|e| ProxyError::Config(format!("routing table {}: {e}", table_path.display())))?;
		Self::new(catalog.models, table, aliases)
	}

	pub fn new(
		models: Vec<ModelSpec>,
		table: RoutingTable,
		aliases: HashMap<String, String>,
	) -> Result<Self, ProxyError> {
		let mut by_id = HashMap::new();
		for spec in models {
			if by_id.insert(spec.id.clone(), spec).is_some() {
				return Err(ProxyError::Config("duplicate model id in catalog".into()));
			}
		}
		for id in table.all_ids() {
			if !by_id.contains_key(id) {
				return Err(ProxyError::Config(format!(
					"routing table references unknown model: {id}"
				)));
			}
		}
		for (alias, id) in &aliases {
			if !by_id.contains_key(id) {
				return Err(ProxyError::Config(format!(
					"alias {alias} references unknown model: {id}"
				)));
			}
		}
		let mut hierarchy: Vec<String> = by_id.keys().cloned().collect();
		hierarchy.sort_by(|a, b| {
			by_id[a]
				.blended_cost()
				.total_cmp(&by_id[b].blended_cost())
				.then_with(|| a.cmp(b))
		});
		Ok(ModelRegistry {
			models: by_id,
			hierarchy,
			table,
			aliases,
		})
	}

	pub fn get(&self, id: &str) -> Option<&ModelSpec> {
		self.models.get(id)
	}

	pub fn resolve_alias(&self, alias: &str) -> Option<&ModelSpec> {
		self.aliases.get(alias).and_then(|id| self.models.get(id))
	}

	pub fn table(&self) -> &RoutingTable {
		&self.table
	}

	/// Catalog ids ordered cheapest first.
	pub fn hierarchy(&self) -> &[String] {
		&self.hierarchy
	}

	/// One step below `id` in the hierarchy. `None` when `id` is already the
	/// floor or is not a registered model.
	pub fn step_down(&self, id: &str) -> Option<&ModelSpec> {
		let pos = self.hierarchy.iter().position(|m| m == id)?;
		let below = self.hierarchy.get(pos.checked_sub(1)?)?;
		self.models.get(below)
	}

	/// Cheapest model satisfying `keep`, by blended cost.
	pub fn cheapest_where(&self, keep: impl Fn(&ModelSpec) -> bool) -> Option<&ModelSpec> {
		self
			.hierarchy
			.iter()
			.map(|id| &self.models[id])
			.find(|m| keep(m))
	}

	/// The most expensive catalog model; the stats baseline.
	pub fn most_expensive(&self) -> Option<&ModelSpec> {
		self.hierarchy.last().map(|id| &self.models[id])
	}
}


#[cfg(test)]
mod tests {
	use super::testutil::{registry, spec};
	use super::*;

	#[test]
	fn hierarchy_orders_by_blended_cost() {
		let r = registry();
		assert_eq!(
			r.hierarchy(),
			&["local-8b", "flash-2", "mini-4", "sonnet-4", "opus-4"]
		);
		assert_eq!(r.most_expensive().unwrap().id, "opus-4");
	}

	#[test]
	fn step_down_walks_one_below() {
		let r = registry();
		assert_eq!(r.step_down("opus-4").unwrap().id, "sonnet-4");
		assert_eq!(r.step_down("sonnet-4").unwrap().id, "mini-4");
		assert!(r.step_down("local-8b").is_none());
		assert!(r.step_down("not-a-model").is_none());
	}

	#[test]
	fn unknown_routing_table_id_is_fatal() {
		let models = vec![spec("only", ProviderTag::Openai, 1.0, 2.0)];
		let table: RoutingTable =
			serde_json::from_str(r#"{"eco": {"simple": ["ghost"]}}"#).unwrap();
		let err = ModelRegistry::new(models, table, HashMap::new()).unwrap_err();
		assert!(err.to_string().contains("ghost"), "{err}");
	}

	#[test]
	fn unknown_alias_target_is_fatal() {
		let models = vec![spec("only", ProviderTag::Openai, 1.0, 2.0)];
		let aliases = HashMap::from([("opus".to_string(), "ghost".to_string())]);
		let err = ModelRegistry::new(models, RoutingTable::default(), aliases).unwrap_err();
		assert!(err.to_string().contains("ghost"), "{err}");
	}

	#[test]
	fn performance_table_key_loads_as_gigachad() {
		let table: RoutingTable =
			serde_json::from_str(r#"{"performance": {"complex": ["x"]}}"#).unwrap();
		assert_eq!(table.gigachad.complex, vec!["x"]);
	}

	#[test]
	fn cost_estimate_scales_per_million() {
		let m = spec("m", ProviderTag::Openai, 3.0, 15.0);
		let cost = m.estimate_cost_usd(1_000_000, 1_000_000);
		assert!((cost - 18.0).abs() < 1e-9);
		assert!((m.estimate_cost_usd(500, 200) - (500.0 * 3.0 + 200.0 * 15.0) / 1e6).abs() < 1e-12);
	}
}
