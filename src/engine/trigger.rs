use crate::models::Job;

/// Which way the monitored metric must move to be favorable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Lower is better: buying on a price dip
    Falling,
    /// Higher is better: yields
    Rising,
}

impl Direction {
    fn improves(self, candidate: f64, reference: f64) -> bool {
        match self {
            Direction::Falling => candidate < reference,
            Direction::Rising => candidate > reference,
        }
    }

    fn worsens(self, candidate: f64, reference: f64) -> bool {
        match self {
            Direction::Falling => candidate > reference,
            Direction::Rising => candidate < reference,
        }
    }
}

/// Outcome of feeding one observation into the trailing trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailDecision {
    /// Threshold not crossed yet
    Waiting,
    /// Threshold crossed this tick; extremum seeded
    Crossed { extreme: f64 },
    /// Still moving favorably; extremum advanced
    Extended { extreme: f64 },
    /// Crossed and holding at the extremum
    Holding,
    /// Reversed from the extremum: trade now
    Fire,
}

impl TrailDecision {
    /// Whether job state changed and needs persisting
    pub fn mutated(&self) -> bool {
        matches!(self, TrailDecision::Crossed { .. } | TrailDecision::Extended { .. })
    }
}

/// Trailing-threshold trigger
///
/// Crossing the threshold arms it, the best value since is tracked, and it
/// fires only once the metric moves back past that best value.
#[derive(Debug, Clone, Copy)]
pub struct TrailingTrigger {
    pub direction: Direction,
    pub threshold: f64,
}

impl TrailingTrigger {
    pub fn new(direction: Direction, threshold: f64) -> Self {
        Self {
            direction,
            threshold,
        }
    }

    /// Decide from explicit trailing state without touching a job
    pub fn decide(&self, crossed: bool, extreme: f64, metric: f64) -> TrailDecision {
        if crossed {
            if self.direction.worsens(metric, extreme) {
                TrailDecision::Fire
            } else if self.direction.improves(metric, extreme) {
                TrailDecision::Extended { extreme: metric }
            } else {
                TrailDecision::Holding
            }
        } else if self.direction.improves(metric, self.threshold) {
            TrailDecision::Crossed { extreme: metric }
        } else {
            TrailDecision::Waiting
        }
    }

    /// Feed `metric` and update the job's `crossed`/`extreme_value`
    pub fn observe(&self, job: &mut Job, metric: f64) -> TrailDecision {
        let decision = self.decide(job.crossed, job.extreme_value, metric);

        match decision {
            TrailDecision::Crossed { extreme } => {
                job.crossed = true;
                job.extreme_value = extreme;
            }
            TrailDecision::Extended { extreme } => {
                job.extreme_value = extreme;
            }
            TrailDecision::Waiting | TrailDecision::Holding | TrailDecision::Fire => {}
        }

        decision
    }
}
