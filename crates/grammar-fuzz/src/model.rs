//! Decision models.
//!
//! A model is the policy surface consulted by the generation runtime at
//! every alternation, quantifier and charset. The default model decides
//! uniformly at random; wrappers compose around an inner model to bias
//! ([`WeightedModel`]), adapt ([`CooldownModel`]) or override per rule
//! ([`DispatchingModel`]) the decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use derive_new::new as New;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graph::Charset;

/// Identity of an alternative: `(rule name, alternation index within the
/// rule, alternative index within the alternation)`.
pub type AltKey = (String, usize, usize);

/// Decision policy consulted by the generator.
///
/// `node` is the name of the rule being generated; `idx` identifies the
/// decision site within that rule.
pub trait Model {
    /// Chooses one of `weights.len()` alternatives. Zero-weighted
    /// alternatives must not be chosen; the runtime has already applied
    /// its escape logic when all weights are zero.
    fn choice(&mut self, node: &str, idx: usize, weights: &[f64]) -> usize;

    /// Decides whether to produce one more iteration of a quantified
    /// subtree; only called while `start <= cnt < stop` and the size limit
    /// still admits an iteration.
    fn quantify(
        &mut self,
        node: &str,
        idx: usize,
        cnt: usize,
        start: usize,
        stop: Option<usize>,
    ) -> bool;

    /// Picks a scalar from the explicit codepoint set of a charset.
    fn charset(&mut self, node: &str, idx: usize, chars: &Charset) -> char;
}

/// The unguided random model: chooses proportionally to the weights,
/// flips a fair coin at quantifiers, samples charsets uniformly.
#[derive(Debug)]
pub struct DefaultModel {
    rng: StdRng,
}

impl DefaultModel {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for DefaultModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for DefaultModel {
    fn choice(&mut self, _node: &str, _idx: usize, weights: &[f64]) -> usize {
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return 0;
        }
        let mut remaining = self.rng.random_range(0.0..total);
        for (i, weight) in weights.iter().enumerate() {
            if remaining < *weight {
                return i;
            }
            remaining -= weight;
        }
        weights.len() - 1
    }

    fn quantify(
        &mut self,
        _node: &str,
        _idx: usize,
        _cnt: usize,
        _start: usize,
        _stop: Option<usize>,
    ) -> bool {
        self.rng.random()
    }

    fn charset(&mut self, _node: &str, _idx: usize, chars: &Charset) -> char {
        chars
            .nth(self.rng.random_range(0..chars.len()))
            .expect("charsets are non-empty by construction")
    }
}

/// Wrapper that pre-multiplies alternative weights by a static multiplier
/// map before delegating.
#[derive(New)]
pub struct WeightedModel {
    model: Box<dyn Model>,
    weights: HashMap<AltKey, f64>,
}

impl std::fmt::Debug for WeightedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedModel")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

impl WeightedModel {
    fn multiplier(weights: &HashMap<AltKey, f64>, node: &str, idx: usize, i: usize) -> f64 {
        weights
            .get(&(node.to_owned(), idx, i))
            .copied()
            .unwrap_or(1.0)
    }
}

impl Model for WeightedModel {
    fn choice(&mut self, node: &str, idx: usize, weights: &[f64]) -> usize {
        let scaled: Vec<f64> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| w * Self::multiplier(&self.weights, node, idx, i))
            .collect();
        self.model.choice(node, idx, &scaled)
    }

    fn quantify(
        &mut self,
        node: &str,
        idx: usize,
        cnt: usize,
        start: usize,
        stop: Option<usize>,
    ) -> bool {
        self.model.quantify(node, idx, cnt, start, stop)
    }

    fn charset(&mut self, node: &str, idx: usize, chars: &Charset) -> char {
        self.model.charset(node, idx, chars)
    }
}

/// Wrapper that downscales the weight of an alternative each time it is
/// chosen, renormalizing within the alternation afterwards.
///
/// The weight map may be shared between generators running on parallel
/// workers; it is guarded by a mutex so that updates stay atomic with
/// respect to each other.
#[derive(New)]
pub struct CooldownModel {
    model: Box<dyn Model>,
    /// Factor applied to a chosen alternative's multiplier; 1.0 means no
    /// cooldown.
    cooldown: f64,
    weights: Arc<Mutex<HashMap<AltKey, f64>>>,
}

impl std::fmt::Debug for CooldownModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownModel")
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl Model for CooldownModel {
    fn choice(&mut self, node: &str, idx: usize, weights: &[f64]) -> usize {
        let scaled: Vec<f64> = {
            let map = self.weights.lock().expect("cooldown weight map lock");
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    w * map
                        .get(&(node.to_owned(), idx, i))
                        .copied()
                        .unwrap_or(1.0)
                })
                .collect()
        };
        let choice = self.model.choice(node, idx, &scaled);

        let mut map = self.weights.lock().expect("cooldown weight map lock");
        let chosen = map.entry((node.to_owned(), idx, choice)).or_insert(1.0);
        *chosen *= self.cooldown;
        let sum: f64 = (0..weights.len())
            .map(|i| {
                map.get(&(node.to_owned(), idx, i))
                    .copied()
                    .unwrap_or(1.0)
            })
            .sum();
        for i in 0..weights.len() {
            let entry = map.entry((node.to_owned(), idx, i)).or_insert(1.0);
            *entry /= sum;
        }
        choice
    }

    fn quantify(
        &mut self,
        node: &str,
        idx: usize,
        cnt: usize,
        start: usize,
        stop: Option<usize>,
    ) -> bool {
        self.model.quantify(node, idx, cnt, start, stop)
    }

    fn charset(&mut self, node: &str, idx: usize, chars: &Charset) -> char {
        self.model.charset(node, idx, chars)
    }
}

pub type ChoiceOverride = Box<dyn FnMut(usize, &[f64]) -> usize>;
pub type QuantifyOverride = Box<dyn FnMut(usize, usize, usize, Option<usize>) -> bool>;
pub type CharsetOverride = Box<dyn FnMut(usize, &Charset) -> char>;

/// Wrapper that overrides decisions in specific rules. Handlers are
/// registered per rule name at construction; everything else falls
/// through to the inner model.
#[derive(Default)]
pub struct DispatchingModel {
    model: Option<Box<dyn Model>>,
    choices: HashMap<String, ChoiceOverride>,
    quantifies: HashMap<String, QuantifyOverride>,
    charsets: HashMap<String, CharsetOverride>,
}

impl std::fmt::Debug for DispatchingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchingModel")
            .field("choices", &self.choices.keys())
            .field("quantifies", &self.quantifies.keys())
            .field("charsets", &self.charsets.keys())
            .finish_non_exhaustive()
    }
}

impl DispatchingModel {
    pub fn new(model: Box<dyn Model>) -> Self {
        Self {
            model: Some(model),
            ..Self::default()
        }
    }

    pub fn override_choice(mut self, rule: impl Into<String>, handler: ChoiceOverride) -> Self {
        self.choices.insert(rule.into(), handler);
        self
    }

    pub fn override_quantify(mut self, rule: impl Into<String>, handler: QuantifyOverride) -> Self {
        self.quantifies.insert(rule.into(), handler);
        self
    }

    pub fn override_charset(mut self, rule: impl Into<String>, handler: CharsetOverride) -> Self {
        self.charsets.insert(rule.into(), handler);
        self
    }

    fn inner(&mut self) -> &mut Box<dyn Model> {
        self.model.as_mut().expect("dispatching model has an inner model")
    }
}

impl Model for DispatchingModel {
    fn choice(&mut self, node: &str, idx: usize, weights: &[f64]) -> usize {
        match self.choices.get_mut(node) {
            Some(handler) => handler(idx, weights),
            None => self.inner().choice(node, idx, weights),
        }
    }

    fn quantify(
        &mut self,
        node: &str,
        idx: usize,
        cnt: usize,
        start: usize,
        stop: Option<usize>,
    ) -> bool {
        match self.quantifies.get_mut(node) {
            Some(handler) => handler(idx, cnt, start, stop),
            None => self.inner().quantify(node, idx, cnt, start, stop),
        }
    }

    fn charset(&mut self, node: &str, idx: usize, chars: &Charset) -> char {
        match self.charsets.get_mut(node) {
            Some(handler) => handler(idx, chars),
            None => self.inner().charset(node, idx, chars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_choice_respects_zero_weights() {
        let mut model = DefaultModel::with_seed(42);
        for _ in 0..64 {
            let choice = model.choice("r", 0, &[0.0, 1.0, 0.0]);
            assert_eq!(choice, 1);
        }
    }

    #[test]
    fn default_charset_samples_members() {
        let mut model = DefaultModel::with_seed(7);
        let charset = Charset::new([(97, 99)]);
        for _ in 0..32 {
            let c = model.charset("r", 0, &charset);
            assert!(c == 'a' || c == 'b');
        }
    }

    #[test]
    fn weighted_model_masks_alternatives() {
        let weights = HashMap::from([(("r".to_owned(), 0, 0), 0.0)]);
        let mut model = WeightedModel::new(Box::new(DefaultModel::with_seed(3)), weights);
        for _ in 0..64 {
            assert_eq!(model.choice("r", 0, &[1.0, 1.0]), 1);
        }
    }

    #[test]
    fn cooldown_model_decays_chosen_alternative() {
        let shared = Arc::new(Mutex::new(HashMap::new()));
        let mut model = CooldownModel::new(
            Box::new(DefaultModel::with_seed(1)),
            0.5,
            Arc::clone(&shared),
        );
        // Only one viable alternative, so it is chosen and cooled down.
        model.choice("r", 0, &[1.0, 0.0]);
        let map = shared.lock().unwrap();
        let w0 = map[&("r".to_owned(), 0, 0)];
        let w1 = map[&("r".to_owned(), 0, 1)];
        assert!(w0 < w1);
        // Renormalized within the alternation.
        assert!((w0 + w1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dispatching_model_prefers_overrides() {
        let mut model = DispatchingModel::new(Box::new(DefaultModel::with_seed(5)))
            .override_choice("special", Box::new(|_, _| 2));
        assert_eq!(model.choice("special", 0, &[1.0, 1.0, 0.1]), 2);
        // Unregistered rules keep the default behavior.
        assert_eq!(model.choice("other", 0, &[0.0, 1.0]), 1);
    }
}
