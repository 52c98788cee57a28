// Timer liveness verdicts end-to-end: a callback that posts events to its
// own unit, stops itself by returning a negative value, and is then
// reported inactive.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use moot::{DispatchConfig, Dispatcher, MsgId, Timer, Unit, UnitId};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct Ticker {
    dispatcher: Arc<Dispatcher>,
    self_id: OnceLock<UnitId>,
    ticks: AtomicI32,
    events: AtomicUsize,
}

impl Unit for Ticker {
    fn on_tick(&self, _timer: moot::Handle, _now_ms: i64) -> i32 {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 4 {
            return -1;
        }
        if let Some(id) = self.self_id.get() {
            let _ = self.dispatcher.post_event(*id, MsgId::new(77).unwrap());
        }
        0
    }

    fn on_event(&self, _msg: MsgId) -> i32 {
        self.events.fetch_add(1, Ordering::SeqCst);
        0
    }
}

#[test]
fn callback_stops_itself_after_four_ticks() {
    init_tracing();
    let dispatcher = Dispatcher::new(DispatchConfig::default()).unwrap();
    let timer = Timer::new(Arc::clone(&dispatcher));

    let ticker = Arc::new(Ticker {
        dispatcher: Arc::clone(&dispatcher),
        self_id: OnceLock::new(),
        ticks: AtomicI32::new(0),
        events: AtomicUsize::new(0),
    });
    let unit: Arc<dyn Unit> = ticker.clone();
    let id = dispatcher.register(&unit);
    ticker.self_id.set(id).unwrap();

    let handle = timer.create(&unit, 500).unwrap();
    assert!(timer.is_active(handle));

    let deadline = Instant::now() + Duration::from_secs(10);
    while timer.is_active(handle) {
        assert!(Instant::now() < deadline, "timer never went inactive");
        std::thread::sleep(Duration::from_millis(50));
    }

    // settle the dispatcher queue, then check the verdict trail
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ticker.ticks.load(Ordering::SeqCst), 5);
    assert_eq!(ticker.events.load(Ordering::SeqCst), 4);
}

struct CountingUnit {
    ticks: AtomicUsize,
}

impl Unit for CountingUnit {
    fn on_tick(&self, _timer: moot::Handle, _now_ms: i64) -> i32 {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        0
    }
}

#[test]
fn removed_timer_stops_firing() {
    init_tracing();
    let dispatcher = Dispatcher::new(DispatchConfig::default()).unwrap();
    let timer = Timer::new(Arc::clone(&dispatcher));

    let counter = Arc::new(CountingUnit {
        ticks: AtomicUsize::new(0),
    });
    let unit: Arc<dyn Unit> = counter.clone();
    let handle = timer.create(&unit, 50).unwrap();

    // let it tick at least once
    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.ticks.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "timer never fired");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(timer.remove(handle));
    assert!(!timer.is_active(handle));
    let frozen = counter.ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(300));
    // at most one in-flight tick may still land after removal
    assert!(counter.ticks.load(Ordering::SeqCst) <= frozen + 1);
}

#[test]
fn two_timers_fire_independently() {
    init_tracing();
    let dispatcher = Dispatcher::new(DispatchConfig::default()).unwrap();
    let timer = Timer::new(Arc::clone(&dispatcher));

    let fast = Arc::new(CountingUnit {
        ticks: AtomicUsize::new(0),
    });
    let slow = Arc::new(CountingUnit {
        ticks: AtomicUsize::new(0),
    });
    let fast_unit: Arc<dyn Unit> = fast.clone();
    let slow_unit: Arc<dyn Unit> = slow.clone();

    timer.create(&fast_unit, 50).unwrap();
    timer.create(&slow_unit, 400).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while fast.ticks.load(Ordering::SeqCst) < 5 || slow.ticks.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline, "timers starved");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(fast.ticks.load(Ordering::SeqCst) >= slow.ticks.load(Ordering::SeqCst));
}

#[test]
fn remove_all_drains_the_table() {
    init_tracing();
    let dispatcher = Dispatcher::new(DispatchConfig::default()).unwrap();
    let timer = Timer::new(Arc::clone(&dispatcher));

    let counter = Arc::new(CountingUnit {
        ticks: AtomicUsize::new(0),
    });
    let unit: Arc<dyn Unit> = counter.clone();
    let a = timer.create(&unit, 50).unwrap();
    let b = timer.create(&unit, 60).unwrap();

    timer.remove_all();
    assert!(!timer.is_active(a));
    assert!(!timer.is_active(b));
}

struct DeadlineRecorder {
    stamps: Mutex<Vec<i64>>,
}

impl Unit for DeadlineRecorder {
    fn on_tick(&self, _timer: moot::Handle, now_ms: i64) -> i32 {
        self.stamps.lock().unwrap().push(now_ms);
        0
    }
}

#[test]
fn ticks_respect_the_interval() {
    init_tracing();
    let dispatcher = Dispatcher::new(DispatchConfig::default()).unwrap();
    let timer = Timer::new(Arc::clone(&dispatcher));

    let recorder = Arc::new(DeadlineRecorder {
        stamps: Mutex::new(Vec::new()),
    });
    let unit: Arc<dyn Unit> = recorder.clone();
    timer.create(&unit, 100).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while recorder.stamps.lock().unwrap().len() < 4 {
        assert!(Instant::now() < deadline, "not enough ticks");
        std::thread::sleep(Duration::from_millis(20));
    }

    let stamps = recorder.stamps.lock().unwrap();
    for pair in stamps.windows(2) {
        // never early; lateness is bounded by scheduling noise
        assert!(pair[1] - pair[0] >= 95, "ticks too close: {:?}", &*stamps);
    }
}
