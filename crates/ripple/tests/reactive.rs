use std::{cell::Cell, rc::Rc};

use ripple::{
    reactive::{CycleKind, Detached, Reactive, ReactiveError},
    resource::ReactiveLimits,
};

type Cx = Detached<i64>;

fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
    let runs = Rc::new(Cell::new(0));
    (Rc::clone(&runs), runs)
}

#[test]
fn equal_write_does_not_rerun_effect() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let s = rx.signal(0);
    let (runs, seen) = counter();
    rx.effect(
        &mut cx,
        move |rx, cx| {
            rx.read(cx, s)?;
            runs.set(runs.get() + 1);
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(seen.get(), 1);

    assert!(!rx.write(&mut cx, s, 0).unwrap());
    assert_eq!(seen.get(), 1, "unchanged value must not re-run the effect");

    assert!(rx.write(&mut cx, s, 1).unwrap());
    assert_eq!(seen.get(), 2);
}

/// Two dependencies changed within one batch re-run their shared effect once.
#[test]
fn batched_writes_coalesce() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let a = rx.signal(1);
    let b = rx.signal(2);
    let (runs, seen) = counter();
    let total = Rc::new(Cell::new(0));
    let sink = Rc::clone(&total);
    rx.effect(
        &mut cx,
        move |rx, cx| {
            sink.set(rx.read(cx, a)? + rx.read(cx, b)?);
            runs.set(runs.get() + 1);
            Ok(())
        },
    )
    .unwrap();

    rx.batch(&mut cx, |rx, cx| {
        rx.write(cx, a, 10)?;
        rx.write(cx, b, 20)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(seen.get(), 2);
    assert_eq!(total.get(), 30);
}

/// A diamond (a -> left, a -> right, both -> effect) re-runs the effect once per write.
#[test]
fn diamond_dependency_runs_once() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let a = rx.signal(1);
    let left = rx.computed(move |rx, cx| Ok(rx.read(cx, a)? * 2));
    let right = rx.computed(move |rx, cx| Ok(rx.read(cx, a)? + 100));
    let (runs, seen) = counter();
    let last = Rc::new(Cell::new(0));
    let sink = Rc::clone(&last);
    rx.effect(
        &mut cx,
        move |rx, cx| {
            sink.set(rx.read(cx, left)? + rx.read(cx, right)?);
            runs.set(runs.get() + 1);
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(last.get(), 103);

    rx.write(&mut cx, a, 2).unwrap();
    assert_eq!(seen.get(), 2);
    assert_eq!(last.get(), 106);
}

#[test]
fn computed_is_lazy() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let s = rx.signal(3);
    let (derives, seen) = counter();
    let squared = rx.computed(move |rx, cx| {
        derives.set(derives.get() + 1);
        let v = rx.read(cx, s)?;
        Ok(v * v)
    });
    assert_eq!(seen.get(), 0, "nothing runs before the first read");

    assert_eq!(rx.read(&mut cx, squared).unwrap(), 9);
    assert_eq!(rx.read(&mut cx, squared).unwrap(), 9);
    assert_eq!(seen.get(), 1);

    rx.write(&mut cx, s, 4).unwrap();
    rx.write(&mut cx, s, 5).unwrap();
    assert_eq!(seen.get(), 1, "invalidation alone must not recompute");
    assert_eq!(rx.read(&mut cx, squared).unwrap(), 25);
    assert_eq!(seen.get(), 2);
}

#[test]
fn computed_rejects_writes() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let c = rx.computed(|_, _| Ok(1));
    assert_eq!(rx.write(&mut cx, c, 2), Err(ReactiveError::ReadOnly(c)));
}

/// An effect writing its own dependency once settles after a single extra run.
#[test]
fn self_write_settles() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let s = rx.signal(0);
    let (runs, seen) = counter();
    rx.effect(
        &mut cx,
        move |rx, cx| {
            runs.set(runs.get() + 1);
            rx.read(cx, s)?;
            rx.write(cx, s, 5)?;
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(rx.peek(s), Some(&5));
    assert_eq!(seen.get(), 2);
}

#[test]
fn runaway_effect_is_a_cycle() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::new(ReactiveLimits {
        max_flush_rounds: 10,
        ..ReactiveLimits::default()
    });
    let s = rx.signal(0);
    rx.effect(&mut cx, |_, _| Ok(())).unwrap();
    let err = rx
        .effect(
            &mut cx,
            move |rx, cx| {
                let v = rx.read(cx, s)?;
                rx.write(cx, s, v + 1)?;
                Ok(())
            },
        )
        .unwrap_err();
    assert_eq!(err, ReactiveError::Cycle(CycleKind::FlushRounds(10)));
}

#[test]
fn disposed_effect_stops_running() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let s = rx.signal(0);
    let (runs, seen) = counter();
    let effect = rx
        .effect(
            &mut cx,
            move |rx, cx| {
                rx.read(cx, s)?;
                runs.set(runs.get() + 1);
                Ok(())
            },
        )
        .unwrap();
    assert_eq!(rx.subscriber_count(s), 1);
    rx.dispose_effect(effect);
    assert_eq!(rx.subscriber_count(s), 0);
    rx.write(&mut cx, s, 9).unwrap();
    assert_eq!(seen.get(), 1);
    assert_eq!(rx.effect_count(), 0);
}

#[test]
fn untracked_reads_do_not_subscribe() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let tracked = rx.signal(0);
    let hidden = rx.signal(0);
    let (runs, seen) = counter();
    rx.effect(
        &mut cx,
        move |rx, cx| {
            rx.read(cx, tracked)?;
            rx.untracked(|rx| rx.read(cx, hidden))?;
            runs.set(runs.get() + 1);
            Ok(())
        },
    )
    .unwrap();
    rx.write(&mut cx, hidden, 1).unwrap();
    assert_eq!(seen.get(), 1);
    rx.write(&mut cx, tracked, 1).unwrap();
    assert_eq!(seen.get(), 2);
}

#[test]
fn reading_disposed_signal_fails() {
    let mut cx = Cx::default();
    let mut rx = Reactive::<Cx>::default();
    let s = rx.signal(1);
    rx.dispose_signal(s);
    assert_eq!(rx.read(&mut cx, s), Err(ReactiveError::Disposed(s)));
    assert!(!rx.is_alive(s));
}
