//! This module records statistics about deoptimisation. Durations are wall-clock time and so are
//! only ever approximate.

use std::{
    cell::Cell,
    env, fs,
    ops::DerefMut,
    sync::Mutex,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. This is only enabled if the end user defines the environment
/// variable `DEOPTD_LOG_STATS` (or a caller asks for it explicitly).
#[derive(Debug)]
pub struct Stats {
    // Most runs won't record statistics, so the common case is a single `None` check: only if
    // stats are being recorded do we lock a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

#[derive(Debug)]
struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    counters: [u64; Counter::COUNT],
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

/// The events we count. The `to_string` of each variant is its key in the JSON output.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
pub enum Counter {
    #[strum(to_string = "deopts_eager")]
    DeoptsEager,
    #[strum(to_string = "deopts_lazy")]
    DeoptsLazy,
    #[strum(to_string = "deopts_osr")]
    DeoptsOsr,
    #[strum(to_string = "deopts_debugger")]
    DeoptsDebugger,
    /// OSR translations which failed and fell back to the original frame.
    #[strum(to_string = "osr_aborts")]
    OsrAborts,
    #[strum(to_string = "frames_built")]
    FramesBuilt,
    #[strum(to_string = "heap_numbers_materialized")]
    HeapNumbersMaterialized,
    #[strum(to_string = "code_objects_invalidated")]
    CodeObjectsInvalidated,
    #[strum(to_string = "zombie_code_released")]
    ZombieCodeReleased,
}

impl Stats {
    pub fn from_env() -> Self {
        match env::var("DEOPTD_LOG_STATS") {
            Ok(p) => Self::with_output(p),
            Err(_) => Self::disabled(),
        }
    }

    /// Record statistics, writing them to `path` (`-` for stderr) on [Self::output].
    pub fn with_output(path: String) -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new(path))),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// If statistics are enabled, update `inner` by running the function `f`, otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            let mut lk = mtx.lock().unwrap();
            f(lk.deref_mut());
        }
    }

    /// Increment `counter` by `n`.
    pub fn count(&self, counter: Counter, n: u64) {
        self.update_with(|inner| inner.counters[counter as usize] += n);
    }

    /// Return the current value of `counter`, or `None` if statistics are disabled.
    pub fn get(&self, counter: Counter) -> Option<u64> {
        self.inner
            .as_ref()
            .map(|mtx| mtx.lock().unwrap().counters[counter as usize])
    }

    /// Change the [TimingState] the current thread is in, returning the previous state.
    pub fn timing_state(&self, new_state: TimingState) -> TimingState {
        let mut prev = TimingState::None;
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = DEOPT_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
            prev = prev_state;
        });
        prev
    }

    /// Output these statistics to the appropriate output path.
    pub fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    /// These statistics as JSON, or `None` if statistics are disabled.
    pub fn to_json(&self) -> Option<String> {
        self.inner.as_ref().map(|mtx| mtx.lock().unwrap().to_json())
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            counters: [0; Counter::COUNT],
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is sorted by field name so that textual
    /// matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = Counter::iter()
            .map(|c| (c.to_string(), self.counters[c as usize].to_string()))
            .collect::<Vec<_>>();
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a deoptimising thread can go through.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
// New states must not be assigned explicit discriminants. A state whose `to_string` is empty is
// not shown in the JSON output.
pub enum TimingState {
    /// Time spent in this state is not counted towards anything and is not displayed.
    #[strum(to_string = "")]
    None,
    /// Walking a translation and building output frames.
    #[strum(to_string = "duration_translating")]
    Translating,
    /// Allocating deferred heap numbers and arguments objects.
    #[strum(to_string = "duration_materializing")]
    Materializing,
    /// Invalidating and patching optimised code.
    #[strum(to_string = "duration_patching")]
    Patching,
}

thread_local! {
    static DEOPT_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters() {
        let s = Stats::with_output("-".into());
        s.count(Counter::DeoptsEager, 1);
        s.count(Counter::FramesBuilt, 3);
        s.count(Counter::FramesBuilt, 2);
        assert_eq!(s.get(Counter::DeoptsEager), Some(1));
        assert_eq!(s.get(Counter::FramesBuilt), Some(5));
        assert_eq!(s.get(Counter::OsrAborts), Some(0));
        assert_eq!(Stats::disabled().get(Counter::FramesBuilt), None);
    }

    #[test]
    fn json_is_sorted() {
        let s = Stats::with_output("-".into());
        s.count(Counter::ZombieCodeReleased, 2);
        let json = s.to_json().unwrap();
        let keys = json
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .map(|l| l.split('"').next().unwrap().to_owned())
            .collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), Counter::COUNT + TimingState::COUNT - 1);
        assert!(json.contains(r#""zombie_code_released": 2"#));
        assert!(json.contains(r#""duration_patching": 0.000"#));
    }

    #[test]
    fn timing_states() {
        let s = Stats::with_output("-".into());
        s.timing_state(TimingState::Translating);
        assert_eq!(
            s.timing_state(TimingState::Materializing),
            TimingState::Translating
        );
        assert_eq!(s.timing_state(TimingState::None), TimingState::Materializing);
    }
}
