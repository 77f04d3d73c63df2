//! Thinking/answering state of one generation run.

use std::time::Instant;
use tracing::debug;

use crate::protocol::Phase;
use crate::runtime::TokenId;

/// Per-run phase tracking and throughput accounting.
///
/// Starts in [`Phase::Thinking`] and flips to [`Phase::Answering`] the first
/// time the end-of-thinking sentinel is observed; it never flips back.
#[derive(Debug, Clone)]
pub struct GenerationRun {
    sentinel: TokenId,
    phase: Phase,
    first_token_at: Option<Instant>,
    num_tokens: usize,
    tps: Option<f64>,
    output: String,
}

impl GenerationRun {
    pub fn new(sentinel: TokenId) -> Self {
        Self {
            sentinel,
            phase: Phase::Thinking,
            first_token_at: None,
            num_tokens: 0,
            tps: None,
            output: String::new(),
        }
    }

    /// Record a token batch arriving at `now`.
    ///
    /// The phase reported for the batch is the phase after observing it, so
    /// the sentinel's own update is already `answering`.
    pub fn observe(&mut self, tokens: &[TokenId], now: Instant) -> Phase {
        let first = *self.first_token_at.get_or_insert(now);
        self.num_tokens += tokens.len();

        let elapsed_ms = now.saturating_duration_since(first).as_secs_f64() * 1000.0;
        self.tps = throughput(self.num_tokens, elapsed_ms);

        if self.phase == Phase::Thinking && tokens.contains(&self.sentinel) {
            debug!(num_tokens = self.num_tokens, "end of thinking observed");
            self.phase = Phase::Answering;
        }
        self.phase
    }

    pub fn push_output(&mut self, fragment: &str) {
        self.output.push_str(fragment);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn tps(&self) -> Option<f64> {
        self.tps
    }

    /// Concatenation of every fragment streamed so far
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn first_token_at(&self) -> Option<Instant> {
        self.first_token_at
    }
}

/// Tokens per second after `n` tokens, timed from the first token.
///
/// The first token only starts the clock, so it is excluded from the count;
/// `None` until there is a second token and a non-zero interval.
pub fn throughput(n: usize, elapsed_ms: f64) -> Option<f64> {
    if n > 1 && elapsed_ms > 0.0 {
        Some((n - 1) as f64 / elapsed_ms * 1000.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SENTINEL: TokenId = 5;

    #[test]
    fn test_phase_flips_once_at_sentinel() {
        let mut run = GenerationRun::new(SENTINEL);
        let t0 = Instant::now();
        let stream = [4, 10, 11, SENTINEL, 12, 13, 4, 14];

        let phases: Vec<Phase> = stream
            .iter()
            .enumerate()
            .map(|(i, id)| run.observe(&[*id], t0 + Duration::from_millis(i as u64 * 10)))
            .collect();

        let k = 3;
        assert!(phases[..k].iter().all(|p| *p == Phase::Thinking));
        assert!(phases[k..].iter().all(|p| *p == Phase::Answering));
    }

    #[test]
    fn test_no_sentinel_stays_thinking() {
        let mut run = GenerationRun::new(SENTINEL);
        let t0 = Instant::now();
        for i in 0..5 {
            assert_eq!(run.observe(&[20 + i], t0), Phase::Thinking);
        }
        assert_eq!(run.phase(), Phase::Thinking);
    }

    #[test]
    fn test_tps_measured_from_first_token() {
        let mut run = GenerationRun::new(SENTINEL);
        let t0 = Instant::now() + Duration::from_secs(5);

        run.observe(&[1], t0);
        assert_eq!(run.tps(), None);
        assert_eq!(run.first_token_at(), Some(t0));

        run.observe(&[2], t0 + Duration::from_millis(100));
        let tps = run.tps().unwrap();
        assert!((tps - 10.0).abs() < 1e-9);

        run.observe(&[3], t0 + Duration::from_millis(400));
        let tps = run.tps().unwrap();
        assert!((tps - 5.0).abs() < 1e-9);
        assert_eq!(run.num_tokens(), 3);
    }

    #[test]
    fn test_zero_interval_has_no_tps() {
        assert_eq!(throughput(1, 0.0), None);
        assert_eq!(throughput(5, 0.0), None);
        assert_eq!(throughput(0, 10.0), None);
    }
}
