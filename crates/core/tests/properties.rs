use pinsim_core::variant::ATMEGA328;
use pinsim_core::{Device, Level, PinMonitor, TimerConfig, WaveformMode};
use proptest::prelude::*;

const PIND: u16 = 0x29;
const DDRD: u16 = 0x2A;
const PORTD: u16 = 0x2B;

/// Pulses of timer0 channel A over `cycles`, without the first one.
fn timer0_pulses(mode: WaveformMode, prescaler: u32, top: u16, threshold: u16, cycles: u64) -> Vec<(Level, u64)> {
    let mut dev = Device::new(&ATMEGA328);
    let mon = PinMonitor::attach(&mut dev, "D6", true).unwrap();
    dev.configure_timer("timer0", &TimerConfig::pwm(mode, prescaler, top, [threshold, 0]))
        .unwrap();
    dev.advance(cycles);
    mon.pulses().into_iter().skip(1).collect()
}

proptest! {
    #[test]
    fn test_pin_records_never_repeat_a_level(
        writes in prop::collection::vec((0usize..3, any::<u8>()), 1..60)
    ) {
        let mut dev = Device::new(&ATMEGA328);
        let monitors: Vec<PinMonitor> = (0..8)
            .map(|b| PinMonitor::attach(&mut dev, &format!("D{}", b), false).unwrap())
            .collect();
        for (i, (reg, value)) in writes.iter().enumerate() {
            dev.advance(i as u64 % 3);
            dev.write_data([PIND, DDRD, PORTD][*reg], *value);
        }
        for mon in &monitors {
            let mut prev = mon.initial();
            for rec in mon.records() {
                prop_assert_ne!(rec.level, prev);
                prev = rec.level;
            }
            prop_assert_eq!(prev, dev.get_pin(mon.pin()).unwrap().level());
        }
    }

    #[test]
    fn test_fast_pwm_durations(
        top in 2u16..=255,
        frac in 0.0f64..1.0,
        prescaler in prop::sample::select(vec![1u32, 8, 64]),
    ) {
        let t = 1 + ((top - 1) as f64 * frac) as u16;
        prop_assume!(t < top);
        let p = prescaler as u64;
        let r = top as u64 + 1;
        let pulses = timer0_pulses(WaveformMode::FastPwm, prescaler, top, t, 4 * r * p);
        prop_assert!(pulses.len() >= 4);
        for (level, width) in pulses {
            let expected = if level == Level::High { t as u64 * p } else { (r - t as u64) * p };
            prop_assert!(width.abs_diff(expected) <= 2 * p, "{:?} {} vs {}", level, width, expected);
        }
    }

    #[test]
    fn test_phase_correct_doubles_fast_durations(
        top in 2u16..=255,
        frac in 0.0f64..1.0,
        prescaler in prop::sample::select(vec![1u32, 8]),
    ) {
        let t = 1 + ((top - 1) as f64 * frac) as u16;
        prop_assume!(t < top);
        let p = prescaler as u64;
        let r = top as u64 + 1;
        let pulses = timer0_pulses(WaveformMode::PhaseCorrectPwm, prescaler, top, t, 8 * r * p);
        prop_assert!(pulses.len() >= 4);
        for (level, width) in pulses {
            let expected = if level == Level::High { 2 * t as u64 * p } else { 2 * (r - t as u64) * p };
            prop_assert!(width.abs_diff(expected) <= 2 * p, "{:?} {} vs {}", level, width, expected);
        }
    }
}
