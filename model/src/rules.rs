use serde::{Deserialize, Serialize};

use crate::{ModelErr, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KoRule {
    Simple,
    Positional,
    Situational,
    Spight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringRule {
    Area,
    Territory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxRule {
    None,
    Seki,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteHandicapBonus {
    Zero,
    N,
    NMinusOne,
}

/// The rules of a game as seen by the neural net.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rules {
    pub ko_rule: KoRule,
    pub scoring_rule: ScoringRule,
    pub tax_rule: TaxRule,
    pub multi_stone_suicide_legal: bool,
    pub has_button: bool,
    pub white_handicap_bonus: WhiteHandicapBonus,
    pub komi: f32,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            ko_rule: KoRule::Positional,
            scoring_rule: ScoringRule::Area,
            tax_rule: TaxRule::None,
            multi_stone_suicide_legal: true,
            has_button: false,
            white_handicap_bonus: WhiteHandicapBonus::Zero,
            komi: 7.5,
        }
    }
}

/// The values a model accepts for a single rule component.
///
/// Values outside `allowed` are replaced by their entry in `substitutes` when it has one that is
/// itself allowed, otherwise by `fallback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSupport<T> {
    pub allowed: Vec<T>,
    pub fallback: T,
    #[serde(default = "Vec::new")]
    pub substitutes: Vec<(T, T)>,
}

impl<T: Copy + PartialEq + std::fmt::Debug> ComponentSupport<T> {
    /// Creates a new `ComponentSupport` without substitutes.
    ///
    /// # Arguments
    /// * `allowed` - The accepted values.
    /// * `fallback` - The replacement for any value that isn't accepted.
    pub fn new(allowed: &[T], fallback: T) -> Self {
        Self {
            allowed: allowed.to_vec(),
            fallback,
            substitutes: Vec::new(),
        }
    }

    /// A component that only accepts `value`.
    pub fn only(value: T) -> Self {
        Self::new(&[value], value)
    }

    /// Adds an entry to the substitution table.
    pub fn with_substitute(mut self, from: T, to: T) -> Self {
        self.substitutes.push((from, to));
        self
    }

    pub fn accepts(&self, value: T) -> bool {
        self.allowed.contains(&value)
    }

    /// Returns the accepted value closest to `value` according to this table.
    pub fn nearest(&self, value: T) -> T {
        if self.accepts(value) {
            return value;
        }

        self.substitutes
            .iter()
            .find(|(from, _)| *from == value)
            .map(|&(_, to)| to)
            .filter(|&to| self.accepts(to))
            .unwrap_or(self.fallback)
    }

    fn validate(&self, what: &str) -> Result<()> {
        if !self.accepts(self.fallback) {
            return Err(ModelErr::InvalidRules(format!(
                "{what}: fallback {:?} is not an allowed value",
                self.fallback
            )));
        }

        if let Some((from, to)) = self.substitutes.iter().find(|(_, to)| !self.accepts(*to)) {
            return Err(ModelErr::InvalidRules(format!(
                "{what}: substitute {from:?} -> {to:?} maps to a value that isn't allowed"
            )));
        }

        Ok(())
    }
}

/// The rule sets a model was trained for, declared by the model itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSupport {
    pub ko_rule: ComponentSupport<KoRule>,
    pub scoring_rule: ComponentSupport<ScoringRule>,
    pub tax_rule: ComponentSupport<TaxRule>,
    pub multi_stone_suicide: ComponentSupport<bool>,
    pub button: ComponentSupport<bool>,
    pub white_handicap_bonus: ComponentSupport<WhiteHandicapBonus>,
    pub komi_range: (f32, f32),
}

impl RuleSupport {
    /// A table that accepts every rule set.
    pub fn all() -> Self {
        use KoRule::*;
        use WhiteHandicapBonus::*;

        Self {
            ko_rule: ComponentSupport::new(&[Simple, Positional, Situational, Spight], Positional),
            scoring_rule: ComponentSupport::new(
                &[ScoringRule::Area, ScoringRule::Territory],
                ScoringRule::Area,
            ),
            tax_rule: ComponentSupport::new(
                &[TaxRule::None, TaxRule::Seki, TaxRule::All],
                TaxRule::None,
            ),
            multi_stone_suicide: ComponentSupport::new(&[false, true], true),
            button: ComponentSupport::new(&[false, true], false),
            white_handicap_bonus: ComponentSupport::new(&[Zero, N, NMinusOne], Zero),
            komi_range: (-150.0, 150.0),
        }
    }

    /// Checks that the table is usable: every fallback and substitute is itself allowed.
    ///
    /// # Returns
    /// An `InvalidRules` error describing the first offending component.
    pub fn validate(&self) -> Result<()> {
        self.ko_rule.validate("ko_rule")?;
        self.scoring_rule.validate("scoring_rule")?;
        self.tax_rule.validate("tax_rule")?;
        self.multi_stone_suicide.validate("multi_stone_suicide")?;
        self.button.validate("button")?;
        self.white_handicap_bonus.validate("white_handicap_bonus")?;

        let (lo, hi) = self.komi_range;
        if !lo.is_finite() || !hi.is_finite() || lo > hi {
            return Err(ModelErr::InvalidRules(format!(
                "komi_range ({lo}, {hi}) is not a valid range"
            )));
        }

        Ok(())
    }

    /// Whether `rules` is exactly one of the rule sets of this table.
    pub fn accepts(&self, rules: &Rules) -> bool {
        let (lo, hi) = self.komi_range;

        self.ko_rule.accepts(rules.ko_rule)
            && self.scoring_rule.accepts(rules.scoring_rule)
            && self.tax_rule.accepts(rules.tax_rule)
            && self.multi_stone_suicide.accepts(rules.multi_stone_suicide_legal)
            && self.button.accepts(rules.has_button)
            && self.white_handicap_bonus.accepts(rules.white_handicap_bonus)
            && (lo..=hi).contains(&rules.komi)
    }

    /// Returns the supported rule set nearest to `desired`.
    ///
    /// Each component is resolved independently through its own table, so no precedence exists
    /// between components that are unsupported at the same time.
    ///
    /// # Arguments
    /// * `desired` - The rules the caller would like to evaluate with.
    ///
    /// # Returns
    /// The nearest supported rules and whether `desired` was supported as is.
    pub fn nearest(&self, desired: &Rules) -> (Rules, bool) {
        if self.accepts(desired) {
            return (*desired, true);
        }

        let (lo, hi) = self.komi_range;
        let komi = if desired.komi.is_nan() {
            lo.max(0.0).min(hi)
        } else {
            desired.komi.clamp(lo, hi)
        };

        let rules = Rules {
            ko_rule: self.ko_rule.nearest(desired.ko_rule),
            scoring_rule: self.scoring_rule.nearest(desired.scoring_rule),
            tax_rule: self.tax_rule.nearest(desired.tax_rule),
            multi_stone_suicide_legal: self
                .multi_stone_suicide
                .nearest(desired.multi_stone_suicide_legal),
            has_button: self.button.nearest(desired.has_button),
            white_handicap_bonus: self
                .white_handicap_bonus
                .nearest(desired.white_handicap_bonus),
            komi,
        };

        (rules, false)
    }
}

impl Default for RuleSupport {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_may_be_left_out_of_the_header() {
        let json = r#"{ "allowed": ["simple", "positional"], "fallback": "simple" }"#;
        let support: ComponentSupport<KoRule> = serde_json::from_str(json).unwrap();

        let expected = ComponentSupport::new(&[KoRule::Simple, KoRule::Positional], KoRule::Simple);
        assert_eq!(support, expected);
        assert!(support.substitutes.is_empty());
    }

    fn japanese_only() -> RuleSupport {
        RuleSupport {
            ko_rule: ComponentSupport::new(&[KoRule::Simple], KoRule::Simple),
            scoring_rule: ComponentSupport::only(ScoringRule::Territory),
            tax_rule: ComponentSupport::new(&[TaxRule::Seki, TaxRule::All], TaxRule::Seki)
                .with_substitute(TaxRule::None, TaxRule::All),
            multi_stone_suicide: ComponentSupport::only(false),
            button: ComponentSupport::only(false),
            white_handicap_bonus: ComponentSupport::only(WhiteHandicapBonus::Zero),
            komi_range: (0.0, 20.0),
        }
    }

    #[test]
    fn supported_rules_are_returned_unchanged() {
        let support = RuleSupport::all();
        let desired = Rules {
            ko_rule: KoRule::Situational,
            komi: 6.5,
            ..Rules::default()
        };

        assert_eq!(support.nearest(&desired), (desired, true));
    }

    #[test]
    fn unsupported_components_are_replaced() {
        let support = japanese_only();
        let (rules, supported) = support.nearest(&Rules::default());

        assert!(!supported);
        assert!(support.accepts(&rules));
        assert_eq!(rules.ko_rule, KoRule::Simple);
        assert_eq!(rules.scoring_rule, ScoringRule::Territory);
        assert_eq!(rules.tax_rule, TaxRule::All);
        assert!(!rules.multi_stone_suicide_legal);
        assert_eq!(rules.komi, 7.5);
    }

    #[test]
    fn nearest_is_idempotent() {
        let support = japanese_only();
        let (once, _) = support.nearest(&Rules::default());
        let (twice, supported) = support.nearest(&once);

        assert!(supported);
        assert_eq!(once, twice);
    }

    #[test]
    fn komi_is_clamped_into_range() {
        let support = japanese_only();
        let desired = Rules {
            komi: -30.0,
            ..Rules::default()
        };

        let (rules, supported) = support.nearest(&desired);
        assert!(!supported);
        assert_eq!(rules.komi, 0.0);
    }

    #[test]
    fn substitutes_outside_the_allowed_set_are_ignored() {
        let component = ComponentSupport::new(&[KoRule::Simple], KoRule::Simple)
            .with_substitute(KoRule::Spight, KoRule::Positional);

        assert_eq!(component.nearest(KoRule::Spight), KoRule::Simple);
        assert!(component.validate("ko_rule").is_err());
    }

    #[test]
    fn fallback_must_be_allowed() {
        let mut support = RuleSupport::all();
        support.button = ComponentSupport::new(&[false], true);

        assert!(matches!(support.validate(), Err(ModelErr::InvalidRules(_))));
    }
}
