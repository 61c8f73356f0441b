use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use jana_event::{Event, EventLevel, Factory, FactorySet, Result, Slot};

#[derive(Clone)]
struct Track {
    momentum: f64,
}

struct TrackFactory {
    process_calls: Arc<AtomicUsize>,
}

impl Factory for TrackFactory {
    type Object = Track;

    fn process(&mut self, _event: &Event) -> Result<Vec<Track>> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        // Long enough that racing `get` calls overlap the critical
        // section if memoization were broken.
        std::thread::sleep(std::time::Duration::from_millis(5));
        Ok(vec![Track { momentum: 1.25 }])
    }
}

#[test]
fn concurrent_gets_process_exactly_once() {
    let process_calls = Arc::new(AtomicUsize::new(0));
    let mut set = FactorySet::new();
    set.add(Slot::new(TrackFactory {
        process_calls: process_calls.clone(),
    }))
    .unwrap();
    let event = Event::with_factories(EventLevel::PhysicsEvent, set);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let tracks = event.get::<Track>("").unwrap();
                assert_eq!(tracks.len(), 1);
            });
        }
    });
    assert_eq!(process_calls.load(Ordering::SeqCst), 1);
}

struct CalibrationFactory {
    process_calls: Arc<AtomicUsize>,
}

impl Factory for CalibrationFactory {
    type Object = Track;

    fn process(&mut self, _event: &Event) -> Result<Vec<Track>> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Track { momentum: 7.5 }])
    }
}

#[test]
fn persistent_collections_survive_recycling() {
    let process_calls = Arc::new(AtomicUsize::new(0));
    let mut set = FactorySet::new();
    set.add(
        Slot::new(CalibrationFactory {
            process_calls: process_calls.clone(),
        })
        .tag("calib")
        .persistent(),
    )
    .unwrap();
    let mut event = Event::with_factories(EventLevel::PhysicsEvent, set);

    assert_eq!(event.get::<Track>("calib").unwrap().len(), 1);
    event.reset();
    // Still cached: a persistent slot keeps both the collection and its
    // processed status across recycling, so nothing reruns.
    let tracks = event.get::<Track>("calib").unwrap();
    assert_eq!(tracks.len(), 1);
    assert!((tracks[0].momentum - 7.5).abs() < f64::EPSILON);
    drop(tracks);
    assert_eq!(process_calls.load(Ordering::SeqCst), 1);
}
