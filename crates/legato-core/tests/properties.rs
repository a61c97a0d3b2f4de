use legato_core::{
    AXES, DRIVES, EndstopMask, MachineConfig,
    look_ahead::{LookAheadRing, PlannedMove},
    motion_ring::MotionRing,
    segment::{MotionSegment, Profile, StepOutcome},
    sim::RecordingDriver,
};

fn planned(endpoint: [i64; DRIVES], feed_rate: f64) -> PlannedMove {
    PlannedMove::new(endpoint, feed_rate, 5.0, 60.0, 500.0, EndstopMask::new())
}

#[test]
fn bresenham_is_exact() {
    let drives = MachineConfig::default().drive_table();
    bolero::check!()
        .with_type::<([i16; 3], [i8; 2], [i16; 3])>()
        .for_each(|(target, extrusion, start)| {
            let start = [
                start[0] as i64 / 8,
                start[1] as i64 / 8,
                start[2] as i64 / 64,
                0,
                0,
            ];
            let endpoint = [
                target[0] as i64 / 8,
                target[1] as i64 / 8,
                target[2] as i64 / 64,
                extrusion[0] as i64,
                extrusion[1] as i64,
            ];

            let mut segment = MotionSegment::default();
            let outcome = segment.init(&planned(endpoint, 30.0), &start, &drives, 5.0, 5.0);
            if outcome.profile == Profile::NoMove {
                return;
            }

            let mut driver = RecordingDriver::default();
            segment.start(&mut driver);
            let mut ticks = 0;
            while segment.step(&mut driver, false, 0.2) == StepOutcome::Running {
                ticks += 1;
            }

            assert_eq!(ticks + 1, segment.total_steps());
            for drive in 0..DRIVES {
                let expected = if drive < AXES {
                    endpoint[drive] - start[drive]
                } else {
                    endpoint[drive]
                };
                assert_eq!(driver.position[drive], expected, "drive {drive}");
            }
        });
}

#[test]
fn triangle_profiles_meet_in_the_middle() {
    let drives = MachineConfig::default().drive_table();
    bolero::check!()
        .with_type::<(u16, u8, u8)>()
        .for_each(|(steps, u, v)| {
            let steps = *steps as i64 + 1;
            let (u, v) = (*u as f64 / 5.0 + 0.2, *v as f64 / 5.0 + 0.2);
            let mv = planned([steps, 0, 0, 0, 0], 60.0);

            let mut segment = MotionSegment::default();
            let outcome = segment.init(&mv, &[0; DRIVES], &drives, u, v);
            assert!(outcome.entry <= u && outcome.exit <= v);
            assert!(segment.accel_end_step() < segment.decel_start_step());

            if outcome.profile != Profile::Moving {
                // v_peak² = u² + 2a·d_accel = v² + 2a·d_decel with d_accel + d_decel = D
                let a = mv.acceleration;
                let d = segment.distance();
                let peak = segment.peak_velocity();
                let d_accel = (peak * peak - outcome.entry * outcome.entry) / (2.0 * a);
                let d_decel = (peak * peak - outcome.exit * outcome.exit) / (2.0 * a);
                assert!((d_accel + d_decel - d).abs() < 1e-6 * d.max(1.0));
            }
        });
}

#[test]
fn junction_velocity_stays_in_bounds() {
    let drives = MachineConfig::default().drive_table();
    bolero::check!()
        .with_type::<([i16; 2], [i16; 2], u8, u8)>()
        .for_each(|(first, second, feed_a, feed_b)| {
            let mut ring = LookAheadRing::new(8, 4, drives, [0; DRIVES]);
            let a = planned([first[0] as i64, first[1] as i64, 0, 0, 0], *feed_a as f64);
            let b = planned([second[0] as i64, second[1] as i64, 0, 0, 0], *feed_b as f64);
            ring.try_append(a).unwrap();
            ring.try_append(b).unwrap();
            ring.run_planning_pass(true, false, 0.2);

            let junction = ring.iter().next().unwrap();
            assert!(junction.velocity() <= junction.max_speed);
            assert!(junction.velocity() <= a.feed_rate.min(b.feed_rate));
            assert!(junction.velocity() >= a.min_speed.min(b.min_speed));
        });
}

#[test]
fn motion_ring_keeps_two_slots_free() {
    bolero::check!()
        .with_type::<(u8, Vec<bool>)>()
        .for_each(|(capacity, ops)| {
            let capacity = *capacity as usize % 8 + 3;
            let ring = MotionRing::new(capacity);
            let guard = ring.try_lock().unwrap();
            let mut expected = 0;
            for &push in ops {
                if push {
                    if guard.try_push(|_| ()).is_ok() {
                        expected += 1;
                    }
                } else if guard.pop().is_some() {
                    expected -= 1;
                }
                assert_eq!(guard.len(), expected);
                assert!(guard.len() <= capacity - 2);
                assert_eq!(guard.is_full(), guard.len() == capacity - 2);
            }
        });
}
