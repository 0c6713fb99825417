// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driven against a real multi-threaded scheduler instance, mirroring how
//! the reference crate separates unit-level loom models from its own threaded integration test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use task_graph::scheduler::{
    current, current_thread, wait, Destination, NamedQueue, NamedThreadDescriptor, Scheduler,
    SchedulerConfig, TaskPriority, ThreadBand, ThreadId,
};
use task_graph::{GraphEvent, Task};

static SCHEDULER: OnceLock<&'static Scheduler> = OnceLock::new();

fn scheduler() -> &'static Scheduler {
    *SCHEDULER.get_or_init(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Scheduler::startup(SchedulerConfig {
            num_total_threads: 7,
            enable_high_priority_pool: true,
            enable_background_pool: true,
            named_threads: vec![
                NamedThreadDescriptor { name: "game" },
                NamedThreadDescriptor { name: "render" },
            ],
            wait_short_circuit_threshold: 8,
        })
    })
}

fn spawn_any_worker<F>(body: F, event: Option<Arc<GraphEvent>>, num_prereqs: usize) -> Arc<Task>
where
    F: FnOnce(ThreadId, Option<&GraphEvent>) + Send + 'static,
{
    let task = Task::new(body, event, num_prereqs);
    Task::set_destination(
        &task,
        Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
    );
    task
}

#[test]
fn chain_of_three_executes_in_order() {
    let _scheduler = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));

    let e1 = GraphEvent::create();
    let e2 = GraphEvent::create();
    let e3 = GraphEvent::create();

    // T3: prereq E2, subsequent E3.
    let o3 = Arc::clone(&order);
    let t3 = Task::new(
        move |_t, _e| o3.lock().unwrap().push("T3"),
        Some(Arc::clone(&e3)),
        1,
    );
    Task::set_destination(
        &t3,
        Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
    );
    let t3_already_done = usize::from(e2.add_subsequent(Arc::clone(&t3)).is_err());
    Task::prerequisites_complete(&t3, t3_already_done, true);

    // T2: prereq E1, subsequent E2.
    let o2 = Arc::clone(&order);
    let t2 = Task::new(
        move |_t, _e| o2.lock().unwrap().push("T2"),
        Some(Arc::clone(&e2)),
        1,
    );
    Task::set_destination(
        &t2,
        Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
    );
    let t2_already_done = usize::from(e1.add_subsequent(Arc::clone(&t2)).is_err());
    Task::prerequisites_complete(&t2, t2_already_done, true);

    // T1: no prereqs, subsequent E1.
    let o1 = Arc::clone(&order);
    let t1 = spawn_any_worker(move |_t, _e| o1.lock().unwrap().push("T1"), Some(Arc::clone(&e1)), 0);
    Task::prerequisites_complete(&t1, 0, true);

    wait::wait_until_tasks_complete(&[Arc::clone(&e3)], None);
    assert!(e3.is_complete());
    assert_eq!(*order.lock().unwrap(), vec!["T1", "T2", "T3"]);
}

#[test]
fn fan_out_fan_in_runs_every_branch_exactly_once() {
    let _scheduler = scheduler();
    let t0_ran = Arc::new(AtomicUsize::new(0));
    let branch_hits: Arc<Vec<AtomicUsize>> = Arc::new((0..10).map(|_| AtomicUsize::new(0)).collect());
    let tf_ran = Arc::new(AtomicUsize::new(0));

    let e0 = GraphEvent::create();
    let ef = GraphEvent::create();

    let branch_events: Vec<Arc<GraphEvent>> = (0..10).map(|_| GraphEvent::create()).collect();

    let tf_ran2 = Arc::clone(&tf_ran);
    let tf = Task::new(
        move |_t, _e| {
            tf_ran2.fetch_add(1, Ordering::SeqCst);
        },
        Some(Arc::clone(&ef)),
        branch_events.len(),
    );
    Task::set_destination(
        &tf,
        Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
    );
    let mut tf_already_done = 0;
    for branch_event in &branch_events {
        if branch_event.add_subsequent(Arc::clone(&tf)).is_err() {
            tf_already_done += 1;
        }
    }
    Task::prerequisites_complete(&tf, tf_already_done, true);

    for (i, branch_event) in branch_events.iter().enumerate() {
        let hits = Arc::clone(&branch_hits);
        let branch_event_for_task = Arc::clone(branch_event);
        let ti = Task::new(
            move |_t, _e| {
                hits[i].fetch_add(1, Ordering::SeqCst);
            },
            Some(branch_event_for_task),
            1,
        );
        Task::set_destination(
            &ti,
            Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
        );
        let already_done = usize::from(e0.add_subsequent(Arc::clone(&ti)).is_err());
        Task::prerequisites_complete(&ti, already_done, true);
    }

    let t0_ran2 = Arc::clone(&t0_ran);
    let t0 = spawn_any_worker(
        move |_t, _e| {
            t0_ran2.fetch_add(1, Ordering::SeqCst);
        },
        Some(Arc::clone(&e0)),
        0,
    );
    Task::prerequisites_complete(&t0, 0, true);

    wait::wait_until_tasks_complete(&[Arc::clone(&ef)], None);
    assert_eq!(t0_ran.load(Ordering::SeqCst), 1);
    assert!(branch_hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    assert_eq!(tf_ran.load(Ordering::SeqCst), 1);
    assert!(ef.is_complete());
}

#[test]
fn dont_complete_until_defers_dependents_behind_chained_task() {
    let _scheduler = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));

    let ea = GraphEvent::create();
    let eb = GraphEvent::create();

    let order_dependent = Arc::clone(&order);
    let dependent = spawn_any_worker(
        move |_t, _e| order_dependent.lock().unwrap().push("dependent"),
        None,
        1,
    );
    let already_done = usize::from(ea.add_subsequent(Arc::clone(&dependent)).is_err());
    Task::prerequisites_complete(&dependent, already_done, true);

    let order_tb = Arc::clone(&order);
    let order_ta = Arc::clone(&order);
    let eb_for_ta = Arc::clone(&eb);
    let ea_for_ta = Arc::clone(&ea);
    let ta = spawn_any_worker(
        move |_t, _e| {
            order_ta.lock().unwrap().push("TA");
            ea_for_ta.dont_complete_until(Arc::clone(&eb_for_ta));

            let order_tb2 = Arc::clone(&order_tb);
            let tb = spawn_any_worker(
                move |_t, _e| order_tb2.lock().unwrap().push("TB"),
                Some(Arc::clone(&eb_for_ta)),
                0,
            );
            Task::prerequisites_complete(&tb, 0, true);
        },
        Some(Arc::clone(&ea)),
        0,
    );
    Task::prerequisites_complete(&ta, 0, true);

    wait::wait_until_tasks_complete(&[ea], None);
    let order = order.lock().unwrap();
    assert_eq!(order.first(), Some(&"TA"));
    let tb_pos = order.iter().position(|s| *s == "TB").expect("TB ran");
    let dependent_pos = order.iter().position(|s| *s == "dependent").expect("dependent ran");
    assert!(tb_pos < dependent_pos, "dependent ran before TB: {order:?}");
}

#[test]
fn parallel_for_runs_every_index_exactly_once() {
    let _scheduler = scheduler();
    const N: usize = 1000;
    let counter = Arc::new(AtomicUsize::new(0));
    let max_block = Arc::new(AtomicUsize::new(0));
    let counter2 = Arc::clone(&counter);
    let max_block2 = Arc::clone(&max_block);

    task_graph::parallel_for(
        N,
        move |range| {
            let len = range.len();
            max_block2.fetch_max(len, Ordering::SeqCst);
            counter2.fetch_add(len, Ordering::SeqCst);
        },
        false,
    );

    assert_eq!(counter.load(Ordering::SeqCst), N);
    let worker_count = scheduler().get_num_worker_threads().max(1);
    let expected_max = N.div_ceil(worker_count) + N;
    assert!(max_block.load(Ordering::SeqCst) <= expected_max);
}

#[test]
fn named_thread_wait_unblocks_worker_once_game_thread_dispatches() {
    let sched = scheduler();
    sched.attach_to_thread(0);
    assert_eq!(current_thread(), Some(ThreadId::Named(0)));

    let eg = GraphEvent::create();
    let eg_for_task = Arc::clone(&eg);
    let tg = Task::new(move |_t, _e| { let _ = &eg_for_task; }, Some(Arc::clone(&eg)), 0);
    Task::set_destination(&tg, Destination::named(0, NamedQueue::Main, TaskPriority::Normal));
    Task::prerequisites_complete(&tg, 0, true);

    let handle = std::thread::spawn(move || {
        wait::wait_until_tasks_complete(&[Arc::clone(&eg)], Some(ThreadId::Worker { band: ThreadBand::Normal, slot: 0 }));
        eg.is_complete()
    });

    std::thread::sleep(Duration::from_millis(5));
    sched.process_thread_until_idle(0);

    assert!(handle.join().unwrap());
}

#[test]
fn late_subsequent_race_always_queues_and_runs_exactly_once() {
    let _scheduler = scheduler();
    for _ in 0..200 {
        let event = GraphEvent::create();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        // One prerequisite: the event being raced below. Mirrors `attach_to_all`/
        // `attach_prerequisites` in `wait.rs`/`builder.rs` — build with the prerequisite count,
        // attempt registration, then release the setup lock plus one unit per registration that
        // lost the race and must instead be queued directly.
        let task = Task::new(move |_t, _e| { ran2.fetch_add(1, Ordering::SeqCst); }, None, 1);
        Task::set_destination(
            &task,
            Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
        );

        let dispatcher_event = Arc::clone(&event);
        let dispatcher = std::thread::spawn(move || {
            GraphEvent::dispatch_subsequents(&dispatcher_event, ThreadId::Named(0));
        });

        let already_done = usize::from(event.add_subsequent(Arc::clone(&task)).is_err());
        Task::prerequisites_complete(&task, already_done, true);

        dispatcher.join().unwrap();
        wait::wait_until_tasks_complete(&[Arc::clone(&event)], None);

        let tries = 50;
        for _ in 0..tries {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let _ = current();
    }
}
