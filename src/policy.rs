// Declarative policy rules gating and modulating trade decisions.
//
// Rules come from a YAML file with a closed grammar: a fixed feature
// vocabulary in `when` and a fixed action vocabulary in `then`. The loader is
// strict — any unknown key or wrong type rejects the whole file (empty rule
// set plus a warning) so misconfiguration surfaces at load, never at trade
// time.

use serde_yaml::Value;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleScope {
    NewEntry,
    OpenPosition,
    NewEntryBreakdown,
}

impl RuleScope {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "new_entry" => Some(RuleScope::NewEntry),
            "open_position" => Some(RuleScope::OpenPosition),
            "new_entry_breakdown" => Some(RuleScope::NewEntryBreakdown),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Condition {
    Shock30mNatrGte(f64),
    Shock30mNatrLte(f64),
    Shock60mNatrGte(f64),
    Shock60mNatrLte(f64),
    AnchorTradeCountGte(f64),
    AnchorTradeCountLte(f64),
    AnchorWinCountGte(f64),
    AnchorWinCountLte(f64),
    AnchorLastTradeAgoMinGte(f64),
    AnchorLastTradeAgoMinLte(f64),
    TimeInAnchorZoneMinGte(f64),
    TimeInAnchorZoneMinLte(f64),
    TpHitsCountEq(f64),
}

impl Condition {
    fn parse(key: &str, value: f64) -> Option<Self> {
        use Condition::*;
        Some(match key {
            "shock30mNatrGte" => Shock30mNatrGte(value),
            "shock30mNatrLte" => Shock30mNatrLte(value),
            "shock60mNatrGte" => Shock60mNatrGte(value),
            "shock60mNatrLte" => Shock60mNatrLte(value),
            "anchorTradeCountGte" => AnchorTradeCountGte(value),
            "anchorTradeCountLte" => AnchorTradeCountLte(value),
            "anchorWinCountGte" => AnchorWinCountGte(value),
            "anchorWinCountLte" => AnchorWinCountLte(value),
            "anchorLastTradeAgoMinGte" => AnchorLastTradeAgoMinGte(value),
            "anchorLastTradeAgoMinLte" => AnchorLastTradeAgoMinLte(value),
            "timeInAnchorZoneMinGte" => TimeInAnchorZoneMinGte(value),
            "timeInAnchorZoneMinLte" => TimeInAnchorZoneMinLte(value),
            "tpHitsCountEq" => TpHitsCountEq(value),
            _ => return None,
        })
    }

    fn matches(&self, f: &PolicyFeatures) -> bool {
        use Condition::*;
        match *self {
            Shock30mNatrGte(v) => f.shock_30m_natr >= v,
            Shock30mNatrLte(v) => f.shock_30m_natr <= v,
            Shock60mNatrGte(v) => f.shock_60m_natr >= v,
            Shock60mNatrLte(v) => f.shock_60m_natr <= v,
            AnchorTradeCountGte(v) => f.anchor_trade_count as f64 >= v,
            AnchorTradeCountLte(v) => f.anchor_trade_count as f64 <= v,
            AnchorWinCountGte(v) => f.anchor_win_count as f64 >= v,
            AnchorWinCountLte(v) => f.anchor_win_count as f64 <= v,
            // An anchor with no trade history matches neither bound.
            AnchorLastTradeAgoMinGte(v) => {
                f.anchor_last_trade_ago_min.map_or(false, |ago| ago >= v)
            }
            AnchorLastTradeAgoMinLte(v) => {
                f.anchor_last_trade_ago_min.map_or(false, |ago| ago <= v)
            }
            TimeInAnchorZoneMinGte(v) => f.time_in_anchor_zone_min >= v,
            TimeInAnchorZoneMinLte(v) => f.time_in_anchor_zone_min <= v,
            TpHitsCountEq(v) => (f.tp_hits_count as f64 - v).abs() < f64::EPSILON,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct RuleActions {
    allow_trade: Option<bool>,
    size_multiplier: Option<f64>,
    tp_natr_multiplier: Option<f64>,
    sl_natr_multiplier: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub name: String,
    pub priority: f64,
    pub scope: RuleScope,
    when: Vec<Condition>,
    then: RuleActions,
}

/// Feature vector handed to `evaluate`. Counts default to zero for unknown
/// anchors; `anchor_last_trade_ago_min` is None when the anchor never traded.
#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyFeatures {
    pub shock_30m_natr: f64,
    pub shock_60m_natr: f64,
    pub anchor_trade_count: u32,
    pub anchor_win_count: u32,
    pub anchor_last_trade_ago_min: Option<f64>,
    pub time_in_anchor_zone_min: f64,
    pub time_since_entry_min: f64,
    pub tp_hits_count: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyDecision {
    pub allow_trade: bool,
    pub size_multiplier: f64,
    pub tp_natr_multiplier: f64,
    pub sl_natr_multiplier: f64,
    pub reason: String,
}

impl Default for PolicyDecision {
    fn default() -> Self {
        Self {
            allow_trade: true,
            size_multiplier: 1.0,
            tp_natr_multiplier: 1.0,
            sl_natr_multiplier: 1.0,
            reason: "default".to_string(),
        }
    }
}

pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Load rules from a YAML file. Any validation failure yields an empty
    /// rule set with a warning; this never panics or propagates.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "policy rules file unreadable, no rules active");
                return Self::empty();
            }
        };
        match parse_rules(&content) {
            Ok(mut rules) => {
                rules.sort_by(|a, b| a.priority.total_cmp(&b.priority));
                info!(file = %path.display(), rules = rules.len(), "policy rules loaded");
                Self { rules }
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "invalid policy rules file, no rules active");
                Self::empty()
            }
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate rules of the given scope in ascending priority. Multipliers
    /// compose multiplicatively; `allow_trade` is overwritten by each match
    /// and a `false` short-circuits with that rule's name as the reason.
    pub fn evaluate(&self, scope: RuleScope, features: &PolicyFeatures) -> PolicyDecision {
        let mut decision = PolicyDecision::default();
        let mut matched: Vec<&str> = Vec::new();

        for rule in self.rules.iter().filter(|r| r.scope == scope) {
            if !rule.when.iter().all(|c| c.matches(features)) {
                continue;
            }
            matched.push(&rule.name);
            if let Some(allow) = rule.then.allow_trade {
                decision.allow_trade = allow;
                if !allow {
                    decision.reason = rule.name.clone();
                    return decision;
                }
            }
            if let Some(m) = rule.then.size_multiplier {
                decision.size_multiplier *= m;
            }
            if let Some(m) = rule.then.tp_natr_multiplier {
                decision.tp_natr_multiplier *= m;
            }
            if let Some(m) = rule.then.sl_natr_multiplier {
                decision.sl_natr_multiplier *= m;
            }
        }

        if !matched.is_empty() {
            decision.reason = matched.join(",");
        }
        decision
    }
}

fn parse_rules(content: &str) -> anyhow::Result<Vec<PolicyRule>> {
    use anyhow::{anyhow, bail};

    let doc: Value = serde_yaml::from_str(content)?;
    let items = doc
        .as_sequence()
        .ok_or_else(|| anyhow!("rules file must be a YAML list"))?;

    let mut rules = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let map = item
            .as_mapping()
            .ok_or_else(|| anyhow!("rule #{idx} is not a mapping"))?;

        let mut name = None;
        let mut priority = None;
        let mut scope = None;
        let mut when = None;
        let mut then = None;

        for (k, v) in map.iter() {
            let key = k
                .as_str()
                .ok_or_else(|| anyhow!("rule #{idx} has a non-string key"))?;
            match key {
                "name" => {
                    name = Some(
                        v.as_str()
                            .ok_or_else(|| anyhow!("rule #{idx}: name must be a string"))?
                            .to_string(),
                    )
                }
                "priority" => {
                    priority = Some(
                        v.as_f64()
                            .ok_or_else(|| anyhow!("rule #{idx}: priority must be a number"))?,
                    )
                }
                "scope" => {
                    let raw = v
                        .as_str()
                        .ok_or_else(|| anyhow!("rule #{idx}: scope must be a string"))?;
                    scope = Some(
                        RuleScope::parse(raw)
                            .ok_or_else(|| anyhow!("rule #{idx}: unknown scope {raw:?}"))?,
                    );
                }
                "when" => when = Some(parse_when(idx, v)?),
                "then" => then = Some(parse_then(idx, v)?),
                other => bail!("rule #{idx}: unknown key {other:?}"),
            }
        }

        let name = name.ok_or_else(|| anyhow!("rule #{idx}: missing name"))?;
        rules.push(PolicyRule {
            name,
            priority: priority.ok_or_else(|| anyhow!("rule #{idx}: missing priority"))?,
            scope: scope.ok_or_else(|| anyhow!("rule #{idx}: missing scope"))?,
            when: when.ok_or_else(|| anyhow!("rule #{idx}: missing when"))?,
            then: then.ok_or_else(|| anyhow!("rule #{idx}: missing then"))?,
        });
    }
    Ok(rules)
}

fn parse_when(idx: usize, value: &Value) -> anyhow::Result<Vec<Condition>> {
    use anyhow::{anyhow, bail};

    let map = value
        .as_mapping()
        .ok_or_else(|| anyhow!("rule #{idx}: when must be a mapping"))?;
    if map.is_empty() {
        bail!("rule #{idx}: when must not be empty");
    }
    let mut conditions = Vec::with_capacity(map.len());
    for (k, v) in map.iter() {
        let key = k
            .as_str()
            .ok_or_else(|| anyhow!("rule #{idx}: when has a non-string key"))?;
        let num = v
            .as_f64()
            .ok_or_else(|| anyhow!("rule #{idx}: when.{key} must be a number"))?;
        let cond = Condition::parse(key, num)
            .ok_or_else(|| anyhow!("rule #{idx}: unknown feature {key:?}"))?;
        conditions.push(cond);
    }
    Ok(conditions)
}

fn parse_then(idx: usize, value: &Value) -> anyhow::Result<RuleActions> {
    use anyhow::{anyhow, bail};

    let map = value
        .as_mapping()
        .ok_or_else(|| anyhow!("rule #{idx}: then must be a mapping"))?;
    if map.is_empty() {
        bail!("rule #{idx}: then must not be empty");
    }
    let mut actions = RuleActions::default();
    for (k, v) in map.iter() {
        let key = k
            .as_str()
            .ok_or_else(|| anyhow!("rule #{idx}: then has a non-string key"))?;
        match key {
            "allowTrade" => {
                actions.allow_trade = Some(
                    v.as_bool()
                        .ok_or_else(|| anyhow!("rule #{idx}: allowTrade must be a bool"))?,
                )
            }
            "sizeMultiplier" => {
                actions.size_multiplier = Some(
                    v.as_f64()
                        .ok_or_else(|| anyhow!("rule #{idx}: sizeMultiplier must be a number"))?,
                )
            }
            "tpNatrMultiplier" => {
                actions.tp_natr_multiplier = Some(
                    v.as_f64()
                        .ok_or_else(|| anyhow!("rule #{idx}: tpNatrMultiplier must be a number"))?,
                )
            }
            "slNatrMultiplier" => {
                actions.sl_natr_multiplier = Some(
                    v.as_f64()
                        .ok_or_else(|| anyhow!("rule #{idx}: slNatrMultiplier must be a number"))?,
                )
            }
            other => bail!("rule #{idx}: unknown action {other:?}"),
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_from(content: &str) -> PolicyEngine {
        match parse_rules(content) {
            Ok(mut rules) => {
                rules.sort_by(|a, b| a.priority.total_cmp(&b.priority));
                PolicyEngine { rules }
            }
            Err(_) => PolicyEngine::empty(),
        }
    }

    const RULES: &str = r#"
- name: block-hot-anchor
  priority: 10
  scope: new_entry
  when: { anchorWinCountGte: 5 }
  then: { allowTrade: false }
- name: shrink-on-shock
  priority: 20
  scope: new_entry
  when: { shock30mNatrGte: 2.0 }
  then: { sizeMultiplier: 0.5, tpNatrMultiplier: 1.5 }
- name: shrink-more
  priority: 30
  scope: new_entry
  when: { shock60mNatrGte: 1.0 }
  then: { sizeMultiplier: 0.5 }
"#;

    #[test]
    fn veto_short_circuits_with_rule_name() {
        let engine = engine_from(RULES);
        assert_eq!(engine.rule_count(), 3);
        let features = PolicyFeatures {
            anchor_win_count: 5,
            shock_30m_natr: 5.0,
            shock_60m_natr: 5.0,
            ..Default::default()
        };
        let decision = engine.evaluate(RuleScope::NewEntry, &features);
        assert!(!decision.allow_trade);
        assert_eq!(decision.reason, "block-hot-anchor");
        // Later rules never ran.
        assert_eq!(decision.size_multiplier, 1.0);
    }

    #[test]
    fn multipliers_compose_multiplicatively() {
        let engine = engine_from(RULES);
        let features = PolicyFeatures {
            shock_30m_natr: 2.5,
            shock_60m_natr: 1.5,
            ..Default::default()
        };
        let decision = engine.evaluate(RuleScope::NewEntry, &features);
        assert!(decision.allow_trade);
        assert_eq!(decision.size_multiplier, 0.25);
        assert_eq!(decision.tp_natr_multiplier, 1.5);
        assert_eq!(decision.sl_natr_multiplier, 1.0);
        assert_eq!(decision.reason, "shrink-on-shock,shrink-more");
    }

    #[test]
    fn no_match_yields_default_reason() {
        let engine = engine_from(RULES);
        let decision = engine.evaluate(RuleScope::NewEntry, &PolicyFeatures::default());
        assert!(decision.allow_trade);
        assert_eq!(decision.reason, "default");
        assert_eq!(decision.size_multiplier, 1.0);
    }

    #[test]
    fn scope_filters_rules() {
        let engine = engine_from(RULES);
        let features = PolicyFeatures {
            anchor_win_count: 9,
            ..Default::default()
        };
        let decision = engine.evaluate(RuleScope::OpenPosition, &features);
        assert!(decision.allow_trade);
        assert_eq!(decision.reason, "default");
    }

    #[test]
    fn unknown_feature_key_rejects_file() {
        let bad = r#"
- name: typo
  priority: 1
  scope: new_entry
  when: { anchorWinsCountGte: 5 }
  then: { allowTrade: false }
"#;
        assert!(parse_rules(bad).is_err());
        assert_eq!(engine_from(bad).rule_count(), 0);
    }

    #[test]
    fn unknown_action_key_rejects_file() {
        let bad = r#"
- name: typo
  priority: 1
  scope: new_entry
  when: { anchorWinCountGte: 5 }
  then: { allowtrade: false }
"#;
        assert!(parse_rules(bad).is_err());
    }

    #[test]
    fn empty_when_or_then_rejects_file() {
        let bad = r#"
- name: empty
  priority: 1
  scope: new_entry
  when: {}
  then: { allowTrade: false }
"#;
        assert!(parse_rules(bad).is_err());
    }

    #[test]
    fn wrong_value_type_rejects_file() {
        let bad = r#"
- name: wrong
  priority: 1
  scope: new_entry
  when: { anchorWinCountGte: "five" }
  then: { allowTrade: false }
"#;
        assert!(parse_rules(bad).is_err());
    }

    #[test]
    fn unknown_anchor_matches_neither_last_trade_bound() {
        let rules = r#"
- name: recently-traded
  priority: 1
  scope: new_entry
  when: { anchorLastTradeAgoMinLte: 30 }
  then: { allowTrade: false }
- name: stale
  priority: 2
  scope: new_entry
  when: { anchorLastTradeAgoMinGte: 240 }
  then: { sizeMultiplier: 2.0 }
"#;
        let engine = engine_from(rules);
        let decision = engine.evaluate(RuleScope::NewEntry, &PolicyFeatures::default());
        assert!(decision.allow_trade);
        assert_eq!(decision.size_multiplier, 1.0);
        assert_eq!(decision.reason, "default");
    }

    #[test]
    fn priority_orders_evaluation() {
        let rules = r#"
- name: second
  priority: 20
  scope: new_entry
  when: { tpHitsCountEq: 0 }
  then: { allowTrade: false }
- name: first
  priority: 10
  scope: new_entry
  when: { tpHitsCountEq: 0 }
  then: { allowTrade: false }
"#;
        let engine = engine_from(rules);
        let decision = engine.evaluate(RuleScope::NewEntry, &PolicyFeatures::default());
        assert_eq!(decision.reason, "first");
    }
}
