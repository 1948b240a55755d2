//! Keyed scenario evaluation.
//!
//! Every scenario runs under its own [`CancelToken`], keyed by scenario id.
//! Independent scenarios run in parallel with the `threading` feature and
//! sequentially without it. Only successful runs reach the result store, so a
//! failed or cancelled run leaves the previous output of that key in place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{info, warn};

use crate::backend::{CancelToken, RasterBackend};
use crate::catalog::LayerSelection;
use crate::compositor::{Diagnostics, IndexCompositor, SuitabilityResult};
use crate::config::EngineConfig;
use crate::error::{Result, SeplanError};
use crate::geometry::AreaOfInterest;
use crate::stats::{compute_stats, SummaryStats};

/// One recipe to evaluate.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub selection: Arc<LayerSelection>,
    pub aoi: AreaOfInterest,
    pub config: EngineConfig,
}

impl Scenario {
    /// Snapshots `selection`, later edits do not affect the scenario.
    pub fn new(id: impl Into<String>, selection: &LayerSelection, aoi: AreaOfInterest, config: EngineConfig) -> Self {
        Self {
            id: id.into(),
            selection: selection.snapshot(),
            aoi,
            config,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioOutput {
    pub id: String,
    pub result: SuitabilityResult,
    /// One entry per area, primary region first.
    pub stats: Vec<SummaryStats>,
    pub diagnostics: Diagnostics,
    pub elapsed_ms: u64,
}

/// Compose the indices of `scenario` and reduce its statistics.
pub fn evaluate_scenario(
    scenario: &Scenario,
    backend: &dyn RasterBackend,
    cancel: &CancelToken,
) -> Result<ScenarioOutput> {
    let start = Instant::now();
    info!(scenario = %scenario.id, "evaluating scenario");

    let compositor = IndexCompositor::new(&scenario.config, backend, cancel);
    let result = compositor.compose(&scenario.selection, &scenario.aoi)?;
    let stats = compute_stats(&result, &scenario.selection, &scenario.aoi, backend, cancel)?;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(scenario = %scenario.id, elapsed_ms, areas = stats.len(), "scenario finished");
    Ok(ScenarioOutput {
        id: scenario.id.clone(),
        diagnostics: result.diagnostics.clone(),
        result,
        stats,
        elapsed_ms,
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs scenarios against one backend and keeps the last good output per key.
pub struct Dispatcher {
    backend: Arc<dyn RasterBackend>,
    tokens: Mutex<HashMap<String, CancelToken>>,
    store: Mutex<HashMap<String, Arc<ScenarioOutput>>>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn RasterBackend>) -> Self {
        Self {
            backend,
            tokens: Mutex::new(HashMap::new()),
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh token for `id`. A run still holding the previous token of the
    /// same key is cancelled.
    pub fn register(&self, id: &str) -> CancelToken {
        let token = CancelToken::new(id);
        if let Some(old) = lock(&self.tokens).insert(id.to_string(), token.clone()) {
            old.cancel();
        }
        token
    }

    /// Cancel the run keyed by `id`; other keys are unaffected.
    /// Returns `false` for an unknown key.
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.tokens).get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Evaluate all scenarios; results are in input order.
    pub fn run(&self, scenarios: &[Scenario]) -> Vec<(String, Result<Arc<ScenarioOutput>>)> {
        let jobs: Vec<(&Scenario, CancelToken)> = scenarios.iter().map(|s| (s, self.register(&s.id))).collect();

        #[cfg(feature = "threading")]
        let outcomes: Vec<Result<ScenarioOutput>> = {
            use rayon::prelude::*;
            jobs.par_iter()
                .map(|(s, token)| evaluate_scenario(s, self.backend.as_ref(), token))
                .collect()
        };
        #[cfg(not(feature = "threading"))]
        let outcomes: Vec<Result<ScenarioOutput>> = jobs
            .iter()
            .map(|(s, token)| evaluate_scenario(s, self.backend.as_ref(), token))
            .collect();

        jobs.into_iter()
            .zip(outcomes)
            .map(|((s, token), outcome)| {
                let stored = self.finish(&s.id, &token, outcome);
                if let Err(e) = &stored {
                    warn!(scenario = %s.id, error = %e, "scenario failed, keeping previous result");
                }
                (s.id.clone(), stored)
            })
            .collect()
    }

    /// Release the key of a finished run and store its output. A run that was
    /// cancelled or superseded by a newer registration stores nothing.
    fn finish(&self, id: &str, token: &CancelToken, outcome: Result<ScenarioOutput>) -> Result<Arc<ScenarioOutput>> {
        let mut tokens = lock(&self.tokens);
        let current = tokens.get(id).is_some_and(|t| t.same_as(token));
        if current {
            tokens.remove(id);
        }
        let out = outcome?;
        if !current || token.is_cancelled() {
            return Err(SeplanError::Cancelled { scenario: id.to_string() });
        }
        let out = Arc::new(out);
        lock(&self.store).insert(id.to_string(), Arc::clone(&out));
        Ok(out)
    }

    /// Last successful output of `id`.
    pub fn last_result(&self, id: &str) -> Option<Arc<ScenarioOutput>> {
        lock(&self.store).get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, Reducer, Reduction};
    use crate::catalog::BenefitLayer;
    use crate::expr::Expr;
    use crate::geometry::Region;
    use crate::raster::Raster;
    use crate::testutil::{aoi, ramp_raster, test_grid};

    /// Cancels the run keyed `victim` on its first reduction.
    struct CancellingBackend {
        inner: LocalBackend,
        victim: &'static str,
    }

    impl RasterBackend for CancellingBackend {
        fn reduce(&self, expr: &Expr, reducer: &Reducer, region: &Region, cancel: &CancelToken) -> Result<Reduction> {
            if cancel.key() == self.victim {
                cancel.cancel();
            }
            self.inner.reduce(expr, reducer, region, cancel)
        }

        fn materialize(&self, expr: &Expr, region: &Region, cancel: &CancelToken) -> Result<Raster> {
            self.inner.materialize(expr, region, cancel)
        }
    }

    fn local() -> LocalBackend {
        LocalBackend::new(test_grid())
            .with_asset("forest", ramp_raster(0.0, 1.0))
            .unwrap()
            .with_asset("water", ramp_raster(15.0, -1.0))
            .unwrap()
    }

    fn scenario(id: &str, asset: &str) -> Scenario {
        let mut selection = LayerSelection::new();
        selection
            .benefits
            .add(BenefitLayer::benefit(asset, asset, 2).with_theme("t", ""))
            .unwrap();
        Scenario::new(id, &selection, aoi(), EngineConfig::default())
    }

    #[test]
    fn cancelling_one_key_leaves_others_successful() {
        let dispatcher = Dispatcher::new(Arc::new(CancellingBackend {
            inner: local(),
            victim: "b",
        }));
        let out = dispatcher.run(&[scenario("a", "forest"), scenario("b", "forest"), scenario("c", "water")]);

        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(out[0].1.is_ok());
        assert!(matches!(out[1].1, Err(SeplanError::Cancelled { ref scenario }) if scenario == "b"));
        assert!(out[2].1.is_ok());
        assert!(dispatcher.last_result("b").is_none());
        assert!(dispatcher.last_result("c").is_some());
    }

    #[test]
    fn failed_run_keeps_previous_result() {
        let dispatcher = Dispatcher::new(Arc::new(local()));
        let first = dispatcher.run(&[scenario("a", "forest")]);
        assert!(first[0].1.is_ok());
        let stored = dispatcher.last_result("a").unwrap();

        let second = dispatcher.run(&[scenario("a", "missing")]);
        assert!(matches!(second[0].1, Err(SeplanError::UnknownAsset(_))));
        let still = dispatcher.last_result("a").unwrap();
        assert!(Arc::ptr_eq(&stored, &still), "failed run must not replace the stored output");
    }

    #[test]
    fn cancel_flips_only_its_own_token() {
        let dispatcher = Dispatcher::new(Arc::new(local()));
        let a = dispatcher.register("a");
        let b = dispatcher.register("b");
        assert!(dispatcher.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!dispatcher.cancel("unknown"));

        let a2 = dispatcher.register("b");
        assert!(b.is_cancelled(), "re-registering a key cancels the older run");
        assert!(!a2.is_cancelled());
    }

    #[test]
    fn finished_runs_release_their_key() {
        let dispatcher = Dispatcher::new(Arc::new(local()));
        let out = dispatcher.run(&[scenario("a", "forest"), scenario("b", "missing")]);
        assert!(out[0].1.is_ok());
        assert!(out[1].1.is_err());
        assert!(!dispatcher.cancel("a"), "no run of 'a' is in flight");
        assert!(!dispatcher.cancel("b"), "failed runs release their key too");
        assert!(lock(&dispatcher.tokens).is_empty());
    }

    #[test]
    fn superseded_run_does_not_overwrite_newer_output() {
        let dispatcher = Dispatcher::new(Arc::new(local()));
        let older = dispatcher.register("a");
        let newer = dispatcher.register("a");
        assert!(older.is_cancelled());
        // both runs got past their last cancellation check
        let evaluate = || evaluate_scenario(&scenario("a", "forest"), &local(), &CancelToken::none());

        let stored = dispatcher.finish("a", &newer, evaluate()).unwrap();
        let late = dispatcher.finish("a", &older, evaluate());
        assert!(matches!(late, Err(SeplanError::Cancelled { ref scenario }) if scenario == "a"));
        let kept = dispatcher.last_result("a").unwrap();
        assert!(Arc::ptr_eq(&stored, &kept), "older run must not replace the newer output");
    }

    #[test]
    fn cancelled_run_stores_nothing() {
        let dispatcher = Dispatcher::new(Arc::new(local()));
        let token = dispatcher.register("a");
        assert!(dispatcher.cancel("a"));
        let out = evaluate_scenario(&scenario("a", "forest"), &local(), &CancelToken::none());
        assert!(dispatcher.finish("a", &token, out).is_err());
        assert!(dispatcher.last_result("a").is_none());
        assert!(!dispatcher.cancel("a"), "the key is released");
    }

    #[test]
    fn scenario_output_carries_stats_per_area() {
        let out = evaluate_scenario(&scenario("a", "forest"), &local(), &CancelToken::none()).unwrap();
        assert_eq!(out.stats.len(), 1);
        assert!(out.stats[0].contains_key("aoi"));
        assert!(out.diagnostics.skipped_themes.is_empty());
    }
}
