//! Greedy forward feature selection over a pluggable "best next feature" step.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_MIN_IMPROVEMENT: f64 = 0.03;

/// The outcome of one step: the best addition and the score of
/// `current + [feature]`. `feature` is `None` when no candidate beat the
/// step's floor.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub feature: Option<String>,
    pub score: f64,
}

pub trait ChooseNext {
    fn choose_next(&mut self, current: &[String], remaining: &[String]) -> Result<Choice>;
}

/// Tries every candidate with a plain scorer, one after another. The floor is
/// the score of `current` itself, and only strict improvements win, so ties
/// go to the earliest candidate.
pub struct ScoreEach<F> {
    score: F,
}

impl<F> ScoreEach<F>
where
    F: FnMut(&[String]) -> anyhow::Result<f64>,
{
    pub fn new(score: F) -> Self {
        Self { score }
    }
}

impl<F> ChooseNext for ScoreEach<F>
where
    F: FnMut(&[String]) -> anyhow::Result<f64>,
{
    fn choose_next(&mut self, current: &[String], remaining: &[String]) -> Result<Choice> {
        let baseline = (self.score)(current).map_err(Error::callback("scoring current features"))?;
        let mut best = Choice {
            feature: None,
            score: baseline,
        };
        let mut trial = current.to_vec();
        for feature in remaining {
            trial.push(feature.clone());
            let score = (self.score)(&trial)
                .map_err(Error::callback(format!("scoring candidate {}", feature)))?;
            trial.pop();
            if score > best.score {
                best = Choice {
                    feature: Some(feature.clone()),
                    score,
                };
            }
        }
        Ok(best)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionParams {
    pub initial: Vec<String>,
    pub min_improvement: f64,
    /// Defaults to the size of the universe.
    pub max_rounds: Option<usize>,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            initial: Vec::new(),
            min_improvement: DEFAULT_MIN_IMPROVEMENT,
            max_rounds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The best candidate did not clear the minimum improvement.
    BelowThreshold,
    /// The step found nothing better than its floor.
    NoCandidate,
    /// Every feature was accepted.
    Exhausted,
    MaxRounds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: usize,
    pub feature: Option<String>,
    pub score: f64,
    pub improvement: f64,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    /// In acceptance order, starting with the initial features.
    pub accepted: Vec<String>,
    pub improvements: BTreeMap<String, f64>,
    pub rounds: Vec<RoundReport>,
    pub stop: StopReason,
}

/// A round failed. Carries everything accepted before it.
#[derive(Debug, Error)]
#[error("selection_aborted: round {round} failed with {} features accepted: {source}", accepted.len())]
pub struct SelectionAborted {
    /// 1-based; 0 when the inputs were rejected before the first round.
    pub round: usize,
    pub accepted: Vec<String>,
    pub improvements: BTreeMap<String, f64>,
    pub rounds: Vec<RoundReport>,
    #[source]
    pub source: Error,
}

struct SelectionState {
    current: Vec<String>,
    remaining: Vec<String>,
    improvements: BTreeMap<String, f64>,
    baseline: f64,
    rounds: Vec<RoundReport>,
}

impl SelectionState {
    fn accept(&mut self, feature: &str, score: f64, improvement: f64) -> Result<()> {
        let pos = self
            .remaining
            .iter()
            .position(|f| f == feature)
            .ok_or_else(|| Error::Config(format!("chosen feature {} is not a candidate", feature)))?;
        let feature = self.remaining.remove(pos);
        self.improvements.insert(feature.clone(), improvement);
        self.current.push(feature);
        self.baseline = score;
        Ok(())
    }

    fn abort(self, round: usize, source: Error) -> SelectionAborted {
        SelectionAborted {
            round,
            accepted: self.current,
            improvements: self.improvements,
            rounds: self.rounds,
            source,
        }
    }
}

pub struct ForwardSelection<S> {
    strategy: S,
    params: SelectionParams,
}

impl<S: ChooseNext> ForwardSelection<S> {
    pub fn new(strategy: S, params: SelectionParams) -> Self {
        Self { strategy, params }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Runs rounds until the best candidate's gain over the running baseline
    /// is not above `min_improvement`, nothing is left, or the round budget is
    /// spent. The baseline starts at exactly 0.0, not at the score of the
    /// initial features, so round one only needs an absolute score above the
    /// threshold.
    pub fn run(&mut self, universe: &[String]) -> std::result::Result<Selection, SelectionAborted> {
        let mut state = SelectionState {
            current: self.params.initial.clone(),
            remaining: Vec::new(),
            improvements: BTreeMap::new(),
            baseline: 0.0,
            rounds: Vec::new(),
        };
        match partition(universe, &self.params.initial) {
            Ok(remaining) => state.remaining = remaining,
            Err(err) => return Err(state.abort(0, err)),
        }

        let max_rounds = self
            .params
            .max_rounds
            .unwrap_or(universe.len())
            .min(universe.len());
        let min_improvement = self.params.min_improvement;
        let mut stop = None;

        for round in 1..=max_rounds {
            if state.remaining.is_empty() {
                stop = Some(StopReason::Exhausted);
                break;
            }
            info!(
                round,
                current = ?state.current,
                candidates = state.remaining.len(),
                "starting round"
            );
            let choice = match self.strategy.choose_next(&state.current, &state.remaining) {
                Ok(choice) => choice,
                Err(err) => return Err(state.abort(round, err)),
            };
            let improvement = choice.score - state.baseline;
            let Some(feature) = choice.feature else {
                info!(round, score = choice.score, "no candidate beat the floor, done");
                state.rounds.push(RoundReport {
                    round,
                    feature: None,
                    score: choice.score,
                    improvement,
                    accepted: false,
                });
                stop = Some(StopReason::NoCandidate);
                break;
            };
            info!(round, feature = %feature, improvement = %format_args!("{:.3}", improvement), "best candidate");

            let accepted = improvement > min_improvement;
            state.rounds.push(RoundReport {
                round,
                feature: Some(feature.clone()),
                score: choice.score,
                improvement,
                accepted,
            });
            if !accepted {
                info!(
                    round,
                    "gain insignificant ({:.3} <= {:.3}), done", improvement, min_improvement
                );
                stop = Some(StopReason::BelowThreshold);
                break;
            }
            if let Err(err) = state.accept(&feature, choice.score, improvement) {
                return Err(state.abort(round, err));
            }
            info!(round, feature = %feature, "adding feature");
        }

        let stop = stop.unwrap_or(if state.remaining.is_empty() {
            StopReason::Exhausted
        } else {
            StopReason::MaxRounds
        });
        info!(accepted = ?state.current, stop = ?stop, "selection finished");
        Ok(Selection {
            accepted: state.current,
            improvements: state.improvements,
            rounds: state.rounds,
            stop,
        })
    }
}

/// Splits the universe into candidates, keeping its order and dropping what
/// is already accepted.
fn partition(universe: &[String], initial: &[String]) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    for f in universe {
        if !seen.insert(f.as_str()) {
            return Err(Error::Config(format!("feature {} listed twice", f)));
        }
    }
    let mut accepted = BTreeSet::new();
    for f in initial {
        if !accepted.insert(f.as_str()) {
            return Err(Error::Config(format!("initial feature {} listed twice", f)));
        }
    }
    Ok(universe
        .iter()
        .filter(|f| !accepted.contains(f.as_str()))
        .cloned()
        .collect())
}
