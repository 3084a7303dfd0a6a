//! Fault injection for the mutating endpoints.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Endpoint a fault decision is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  ToggleFavorite,
  CreateProduct,
}

/// Decides whether a mutating request fails with a synthetic 500.
pub trait FaultInjector: Send + Sync {
  fn should_fail(&self, operation: Operation) -> bool;
}

/// Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
  fn should_fail(&self, _operation: Operation) -> bool {
    false
  }
}

/// Always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFail;

impl FaultInjector for AlwaysFail {
  fn should_fail(&self, _operation: Operation) -> bool {
    true
  }
}

/// Fails each request independently with probability `rate`.
#[derive(Debug, Clone, Copy)]
pub struct RandomFaults {
  rate: f64,
}

impl RandomFaults {
  /// `rate` is clamped to `[0, 1]`; non-finite rates disable faults.
  pub fn new(rate: f64) -> Self {
    let rate = if rate.is_finite() {
      rate.clamp(0.0, 1.0)
    } else {
      0.0
    };
    Self { rate }
  }

  pub fn rate(&self) -> f64 {
    self.rate
  }
}

impl FaultInjector for RandomFaults {
  fn should_fail(&self, _operation: Operation) -> bool {
    rand::thread_rng().gen_bool(self.rate)
  }
}

/// Replays a fixed sequence of outcomes (`true` = fail), then stops failing.
#[derive(Debug, Default)]
pub struct ScriptedFaults {
  outcomes: Mutex<VecDeque<bool>>,
}

impl ScriptedFaults {
  pub fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
    Self {
      outcomes: Mutex::new(outcomes.into_iter().collect()),
    }
  }
}

impl FaultInjector for ScriptedFaults {
  fn should_fail(&self, _operation: Operation) -> bool {
    self
      .outcomes
      .lock()
      .map(|mut outcomes| outcomes.pop_front().unwrap_or(false))
      .unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_random_fault_extremes() {
    let never = RandomFaults::new(0.0);
    let always = RandomFaults::new(1.0);
    for _ in 0..100 {
      assert!(!never.should_fail(Operation::ToggleFavorite));
      assert!(always.should_fail(Operation::CreateProduct));
    }
  }

  #[test]
  fn test_random_fault_rate_is_clamped() {
    assert_eq!(RandomFaults::new(7.0).rate(), 1.0);
    assert_eq!(RandomFaults::new(-1.0).rate(), 0.0);
    assert_eq!(RandomFaults::new(f64::NAN).rate(), 0.0);
  }

  #[test]
  fn test_scripted_faults_replay_in_order() {
    let faults = ScriptedFaults::new([true, false, true]);
    assert!(faults.should_fail(Operation::ToggleFavorite));
    assert!(!faults.should_fail(Operation::ToggleFavorite));
    assert!(faults.should_fail(Operation::CreateProduct));
    assert!(!faults.should_fail(Operation::CreateProduct));
  }
}
