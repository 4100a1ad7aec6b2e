use std::collections::HashMap;
use std::time::{Duration, Instant};

use servo_sorter::{BoundingBox, Command, Coordinator, CoordinatorState, Detection};

fn det(class_name: &str) -> Detection {
    Detection {
        class_id: 0,
        class_name: class_name.to_string(),
        confidence: 0.8,
        bounding_box: BoundingBox {
            x1: 10.0,
            y1: 10.0,
            x2: 20.0,
            y2: 20.0,
        },
    }
}

fn dets(classes: &[&str]) -> Vec<Detection> {
    classes.iter().map(|c| det(c)).collect()
}

fn coordinator() -> Coordinator {
    Coordinator::new(
        HashMap::from([("battery".to_string(), 45.0), ("motor".to_string(), 135.0)]),
        90.0,
        Duration::from_secs(1),
    )
}

fn ms(base: Instant, millis: u64) -> Instant {
    base + Duration::from_millis(millis)
}

#[test]
fn battery_then_motor_sequence() {
    let mut c = coordinator();
    let t0 = Instant::now();

    assert_eq!(
        c.on_tick(&dets(&["battery"]), t0),
        Some(Command::MoveTo(45.0))
    );
    assert_eq!(
        c.state(),
        &CoordinatorState::Tracking {
            class_name: "battery".to_string(),
            last_seen_at: t0
        }
    );

    assert_eq!(c.on_tick(&dets(&["battery"]), ms(t0, 300)), None);
    assert_eq!(c.state().last_seen_at(), Some(ms(t0, 300)));

    assert_eq!(c.on_tick(&[], ms(t0, 500)), None);

    assert_eq!(c.on_tick(&[], ms(t0, 1500)), Some(Command::MoveTo(90.0)));
    assert_eq!(c.state(), &CoordinatorState::Idle);

    assert_eq!(
        c.on_tick(&dets(&["motor"]), ms(t0, 1600)),
        Some(Command::MoveTo(135.0))
    );
    assert_eq!(c.state().last_matched_class(), Some("motor"));

    // First match wins even though motor is the tracked class.
    assert_eq!(
        c.on_tick(&dets(&["battery", "motor"]), ms(t0, 1700)),
        Some(Command::MoveTo(45.0))
    );
    assert_eq!(c.state().last_matched_class(), Some("battery"));
}

#[test]
fn repeated_class_commands_once() {
    let mut c = coordinator();
    let t0 = Instant::now();
    let commands: Vec<Command> = (0..500)
        .filter_map(|i| c.on_tick(&dets(&["motor"]), ms(t0, i * 33)))
        .collect();
    assert_eq!(commands, vec![Command::MoveTo(135.0)]);
}

#[test]
fn idle_timeout_boundary() {
    let mut c = coordinator();
    let t0 = Instant::now();
    c.on_tick(&dets(&["battery"]), t0);

    assert_eq!(c.on_tick(&[], ms(t0, 1000)), None);
    assert_eq!(c.state().last_matched_class(), Some("battery"));

    assert_eq!(c.on_tick(&[], ms(t0, 1001)), Some(Command::MoveTo(90.0)));
    assert_eq!(c.on_tick(&[], ms(t0, 5000)), None);
}

#[test]
fn never_more_than_one_command_per_tick() {
    let mut c = coordinator();
    let t0 = Instant::now();
    let script: Vec<Vec<Detection>> = vec![
        dets(&["cat", "battery", "motor", "battery"]),
        dets(&["motor", "motor"]),
        vec![],
        dets(&["unknown"]),
        dets(&["battery"]),
    ];
    for (i, tick) in script.iter().enumerate() {
        let command = c.on_tick(tick, ms(t0, i as u64 * 2000));
        assert!(command.iter().count() <= 1);
    }
}

#[test]
fn unknown_only_ticks_stay_idle() {
    let mut c = coordinator();
    let t0 = Instant::now();
    for i in 0..100 {
        assert_eq!(c.on_tick(&dets(&["cat", "bottle"]), ms(t0, i * 100)), None);
    }
    assert_eq!(c.state(), &CoordinatorState::Idle);
}
