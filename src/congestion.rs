//! # Delay-based congestion control
//!
//! LEDBAT-style controller for uTP write sockets. The window grows while
//! the measured one-way queuing delay sits below a 100 ms target and
//! shrinks once it climbs above, so bulk content transfers yield to
//! latency-sensitive traffic sharing the path.
//!
//! ## State
//!
//! | Field | Meaning |
//! |-------|---------|
//! | base delay | minimum one-way delay seen in a sliding one-minute window |
//! | current delay | EWMA of recent one-way delay samples |
//! | `max_window` | bytes the controller allows in flight |
//! | `cur_window` | bytes currently in flight |
//! | rtt / rtt_var | Jacobson/Karels estimators feeding the RTO |
//!
//! The controller is a pure state machine: every entry point takes
//! timestamps in microseconds, so tests script the clock and assert exact
//! trajectories. The socket owns the timers; this type only does the
//! arithmetic.

/// Payload bytes per DATA packet. Content larger than this is split.
pub const MSS: usize = 512;

/// Floor for the congestion window: always room for a few packets.
pub const MIN_WINDOW: usize = 3 * MSS;

/// Ceiling for the congestion window.
pub const MAX_WINDOW: usize = 1024 * 1024;

/// Consecutive RTO expiries tolerated before the socket must reset.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Target one-way queuing delay.
const TARGET_DELAY_MICROS: f64 = 100_000.0;

/// Window gain in bytes per RTT at full off-target.
const GAIN_BYTES_PER_RTT: f64 = 3000.0;

/// Base-delay history: sliding window length and bucket granularity.
const BASE_DELAY_WINDOW_MICROS: u64 = 60_000_000;
const BASE_DELAY_BUCKET_MICROS: u64 = 10_000_000;

/// EWMA weight for new delay samples (1/8, Jacobson-style smoothing).
const CURRENT_DELAY_ALPHA: f64 = 0.125;

const MIN_RTO_MICROS: u64 = 500_000;
const MAX_RTO_MICROS: u64 = 60_000_000;
const INITIAL_RTO_MICROS: u64 = 1_000_000;

/// What the socket must do after an RTO expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Retransmit the earliest unacked packet and keep going.
    Retransmit,
    /// Third consecutive expiry: tear the connection down.
    Reset,
}

#[derive(Debug)]
pub struct CongestionController {
    /// (bucket start micros, minimum delay seen in that bucket).
    base_delay_buckets: std::collections::VecDeque<(u64, u32)>,
    current_delay_micros: Option<f64>,
    max_window: usize,
    cur_window: usize,
    rtt_micros: Option<f64>,
    rtt_var_micros: f64,
    rto_micros: u64,
    consecutive_timeouts: u32,
    /// Receive window the peer last advertised.
    peer_window: usize,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController {
    pub fn new() -> Self {
        Self {
            base_delay_buckets: std::collections::VecDeque::new(),
            current_delay_micros: None,
            max_window: MIN_WINDOW,
            cur_window: 0,
            rtt_micros: None,
            rtt_var_micros: 0.0,
            rto_micros: INITIAL_RTO_MICROS,
            consecutive_timeouts: 0,
            peer_window: MAX_WINDOW,
        }
    }

    /// Whether one more full-size packet fits under the window.
    pub fn window_available(&self) -> bool {
        self.cur_window + MSS <= self.effective_window()
    }

    fn effective_window(&self) -> usize {
        self.max_window.min(self.peer_window.max(MSS))
    }

    pub fn on_send(&mut self, bytes: usize) {
        self.cur_window += bytes;
    }

    /// Process one incoming STATE.
    ///
    /// `counted_bytes` is the in-flight byte count freed by this ACK
    /// (retransmitted packets whose window charge was dropped at timeout
    /// are excluded by the socket). `acked_bytes` is the total newly-acked
    /// volume driving window growth. `delay_micros` is the peer-reported
    /// one-way delay; `rtt_sample_micros` is present only for packets
    /// transmitted exactly once (Karn's rule).
    pub fn on_ack(
        &mut self,
        now_micros: u64,
        counted_bytes: usize,
        acked_bytes: usize,
        delay_micros: u32,
        rtt_sample_micros: Option<u64>,
        peer_window: u32,
    ) {
        self.cur_window = self.cur_window.saturating_sub(counted_bytes);
        self.peer_window = peer_window as usize;
        self.consecutive_timeouts = 0;

        self.record_delay(now_micros, delay_micros);
        if acked_bytes > 0 {
            self.adjust_window(acked_bytes);
        }
        if let Some(sample) = rtt_sample_micros {
            self.update_rtt(sample);
        }
    }

    /// An RTO fired with data still in flight.
    pub fn on_timeout(&mut self) -> TimeoutAction {
        self.max_window = (self.max_window / 2).max(MIN_WINDOW);
        self.cur_window = 0;
        self.rto_micros = (self.rto_micros * 2).min(MAX_RTO_MICROS);
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
            TimeoutAction::Reset
        } else {
            TimeoutAction::Retransmit
        }
    }

    pub fn rto_micros(&self) -> u64 {
        self.rto_micros
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    pub fn cur_window(&self) -> usize {
        self.cur_window
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    fn record_delay(&mut self, now_micros: u64, delay_micros: u32) {
        let bucket = now_micros - now_micros % BASE_DELAY_BUCKET_MICROS;
        match self.base_delay_buckets.back_mut() {
            Some((start, min)) if *start == bucket => *min = (*min).min(delay_micros),
            _ => self.base_delay_buckets.push_back((bucket, delay_micros)),
        }
        while let Some((start, _)) = self.base_delay_buckets.front() {
            if now_micros.saturating_sub(*start) > BASE_DELAY_WINDOW_MICROS {
                self.base_delay_buckets.pop_front();
            } else {
                break;
            }
        }

        let sample = delay_micros as f64;
        self.current_delay_micros = Some(match self.current_delay_micros {
            None => sample,
            Some(current) => current + CURRENT_DELAY_ALPHA * (sample - current),
        });
    }

    fn base_delay(&self) -> f64 {
        self.base_delay_buckets
            .iter()
            .map(|(_, min)| *min)
            .min()
            .unwrap_or(0) as f64
    }

    fn adjust_window(&mut self, acked_bytes: usize) {
        let current = match self.current_delay_micros {
            Some(c) => c,
            None => return,
        };
        let queuing = (current - self.base_delay()).max(0.0);
        let off_target = ((TARGET_DELAY_MICROS - queuing) / TARGET_DELAY_MICROS).max(-1.0);
        let window_factor =
            (acked_bytes.min(self.max_window) as f64) / (acked_bytes.max(self.max_window) as f64);
        let delta = GAIN_BYTES_PER_RTT * off_target * window_factor;
        let next = (self.max_window as f64 + delta).round();
        self.max_window = (next as i64).clamp(MIN_WINDOW as i64, MAX_WINDOW as i64) as usize;
    }

    fn update_rtt(&mut self, sample_micros: u64) {
        let sample = sample_micros as f64;
        match self.rtt_micros {
            None => {
                self.rtt_micros = Some(sample);
                self.rtt_var_micros = sample / 2.0;
            }
            Some(rtt) => {
                let delta = rtt - sample;
                self.rtt_var_micros += (delta.abs() - self.rtt_var_micros) / 4.0;
                self.rtt_micros = Some(rtt + (sample - rtt) / 8.0);
            }
        }
        let rtt = self.rtt_micros.unwrap_or(0.0);
        let rto = (rtt + 4.0 * self.rtt_var_micros) as u64;
        self.rto_micros = rto.clamp(MIN_RTO_MICROS, MAX_RTO_MICROS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a run of ACKs with a fixed delay and inter-ack spacing.
    fn drive_acks(ctrl: &mut CongestionController, n: usize, delay_micros: u32) {
        for i in 0..n {
            ctrl.on_send(MSS);
            ctrl.on_ack(
                (i as u64 + 1) * 50_000,
                MSS,
                MSS,
                delay_micros,
                Some(40_000),
                MAX_WINDOW as u32,
            );
        }
    }

    #[test]
    fn window_grows_below_target_delay() {
        let mut ctrl = CongestionController::new();
        // Establish a low base, then keep the queuing delay near zero.
        drive_acks(&mut ctrl, 50, 5_000);
        assert!(ctrl.max_window() > MIN_WINDOW, "window should open: {}", ctrl.max_window());
    }

    #[test]
    fn window_shrinks_when_delay_exceeds_target() {
        let mut ctrl = CongestionController::new();
        drive_acks(&mut ctrl, 50, 5_000);
        let opened = ctrl.max_window();
        // Base stays at 5 ms; samples jump 250 ms above it.
        drive_acks(&mut ctrl, 80, 255_000);
        assert!(ctrl.max_window() < opened, "window should close: {}", ctrl.max_window());
        assert!(ctrl.max_window() >= MIN_WINDOW);
    }

    #[test]
    fn window_never_leaves_clamp_range() {
        let mut ctrl = CongestionController::new();
        drive_acks(&mut ctrl, 10_000, 0);
        assert!(ctrl.max_window() <= MAX_WINDOW);
        drive_acks(&mut ctrl, 10_000, 10_000_000);
        assert!(ctrl.max_window() >= MIN_WINDOW);
    }

    #[test]
    fn rto_follows_rtt_with_floor() {
        let mut ctrl = CongestionController::new();
        ctrl.on_send(MSS);
        // 40 ms RTT: rto = rtt + 4*var lands under the 500 ms floor.
        ctrl.on_ack(1_000, MSS, MSS, 1_000, Some(40_000), MAX_WINDOW as u32);
        assert_eq!(ctrl.rto_micros(), MIN_RTO_MICROS);

        let mut slow = CongestionController::new();
        slow.on_send(MSS);
        slow.on_ack(1_000, MSS, MSS, 1_000, Some(2_000_000), MAX_WINDOW as u32);
        // First sample: rtt = 2 s, var = 1 s, rto = 6 s.
        assert_eq!(slow.rto_micros(), 6_000_000);
    }

    #[test]
    fn timeout_halves_window_doubles_rto_and_resets_on_third() {
        let mut ctrl = CongestionController::new();
        drive_acks(&mut ctrl, 200, 1_000);
        let window = ctrl.max_window();
        let rto = ctrl.rto_micros();

        assert_eq!(ctrl.on_timeout(), TimeoutAction::Retransmit);
        assert_eq!(ctrl.max_window(), (window / 2).max(MIN_WINDOW));
        assert_eq!(ctrl.cur_window(), 0);
        assert_eq!(ctrl.rto_micros(), (rto * 2).min(MAX_RTO_MICROS));

        assert_eq!(ctrl.on_timeout(), TimeoutAction::Retransmit);
        assert_eq!(ctrl.on_timeout(), TimeoutAction::Reset);
    }

    #[test]
    fn ack_clears_consecutive_timeout_count() {
        let mut ctrl = CongestionController::new();
        ctrl.on_timeout();
        ctrl.on_timeout();
        ctrl.on_send(MSS);
        ctrl.on_ack(1_000, MSS, MSS, 1_000, None, MAX_WINDOW as u32);
        assert_eq!(ctrl.consecutive_timeouts(), 0);
        assert_eq!(ctrl.on_timeout(), TimeoutAction::Retransmit);
    }

    #[test]
    fn peer_window_caps_sending() {
        let mut ctrl = CongestionController::new();
        drive_acks(&mut ctrl, 100, 1_000);
        assert!(ctrl.window_available());
        ctrl.on_send(MSS);
        ctrl.on_ack(10_000_000, MSS, MSS, 1_000, None, 0);
        // Peer advertises a closed window; only a single MSS probe fits.
        ctrl.on_send(MSS);
        assert!(!ctrl.window_available());
    }

    #[test]
    fn base_delay_window_slides() {
        let mut ctrl = CongestionController::new();
        // A low-delay sample far in the past ages out of the base window,
        // so a steady 120 ms level eventually reads as zero queuing.
        ctrl.record_delay(0, 5_000);
        for i in 0..20 {
            ctrl.record_delay(70_000_000 + i * 1_000_000, 120_000);
        }
        assert_eq!(ctrl.base_delay(), 120_000.0);
    }
}
