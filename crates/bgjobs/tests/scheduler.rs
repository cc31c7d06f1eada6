//! End-to-end scheduling scenarios

use bgjobs::providers::{
    ExecutionUnit, ExecutionUnitFactory, LogSink, LogSinkFactory, OnceUnitFactory,
    SequentialIdGenerator, ThreadTask,
};
use bgjobs::{
    CompositeJob, FnJob, JobControl, JobEvent, JobInfo, JobListener, JobStatus, Scheduler,
    SchedulerConfig, Severity, State,
};
use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct QuietLogs;

struct QuietSink;

impl LogSink for QuietSink {
    fn log(&self, _severity: Severity, _message: &str) {}
    fn close(&self) {}
}

impl LogSinkFactory for QuietLogs {
    fn create_log_sink(&self, _job_id: &str) -> Box<dyn LogSink> {
        Box::new(QuietSink)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scheduler() -> Scheduler {
    init_tracing();
    Scheduler::builder()
        .log_sink_factory(Arc::new(QuietLogs))
        .build()
        .unwrap()
}

fn early_abort() {
    let scheduler = scheduler();
    let aborted = scheduler.schedule(FnJob::new("Abort me!", |_| -> anyhow::Result<String> {
        panic!("this should never execute")
    }));
    let executed = scheduler.schedule(FnJob::new("Go ahead... make my day.", |_| {
        Ok("cool.".to_string())
    }));

    aborted.abort();
    let next = scheduler.execute_next().unwrap();
    assert_eq!(next.id(), executed.id());
    assert_eq!(aborted.state(), State::Aborted);
    assert_eq!(*executed.result().unwrap(), "cool.");
    assert_eq!(executed.state(), State::Succeeded);
}

#[test]
fn test_early_abort() {
    early_abort();
}

#[test]
fn test_early_abort_a_lot_of_times() {
    for _ in 0..1000 {
        early_abort();
    }
}

#[test]
fn test_schedule_immediately_when_busy() {
    let scheduler = scheduler();
    scheduler.ensure_started().unwrap();

    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let busy = scheduler.schedule(FnJob::new("busy", move |m| {
        while !m.is_aborting() {
            if release_rx.recv_timeout(Duration::from_millis(50)).is_ok() {
                break;
            }
        }
        Ok("done")
    }));

    assert!(scheduler
        .schedule_immediately(FnJob::new("rejected", |_| Ok("never")))
        .is_none());

    release_tx.send(()).unwrap();
    assert_eq!(*busy.result_timeout(WAIT).unwrap(), "done");
    scheduler.stop();
}

#[test]
fn test_schedule_immediately_when_idle() {
    let scheduler = scheduler();
    scheduler.ensure_started().unwrap();

    let handle = scheduler
        .schedule_immediately(FnJob::new("accepted", |_| Ok(())))
        .unwrap();
    handle.join(Some(WAIT)).unwrap();
    assert_eq!(handle.state(), State::Succeeded);
    scheduler.stop();
}

#[test]
fn test_worker_runs_jobs_in_fifo_order() {
    let scheduler = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let order = Arc::clone(&order);
            scheduler.schedule(FnJob::new(format!("job {}", i), move |_| {
                order.lock().push(i);
                Ok(i)
            }))
        })
        .collect();
    scheduler.ensure_started().unwrap();

    for handle in &handles {
        handle.join(Some(WAIT)).unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    assert!(scheduler.is_idle());
    scheduler.stop();
}

#[test]
fn test_one_job_at_a_time() {
    struct Overlap {
        running: Mutex<usize>,
        max: Mutex<usize>,
    }

    let overlap = Arc::new(Overlap {
        running: Mutex::new(0),
        max: Mutex::new(0),
    });
    let scheduler = scheduler();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let overlap = Arc::clone(&overlap);
            scheduler.schedule(FnJob::new("overlap", move |_| {
                {
                    let mut running = overlap.running.lock();
                    *running += 1;
                    let mut max = overlap.max.lock();
                    *max = (*max).max(*running);
                }
                std::thread::sleep(Duration::from_millis(10));
                *overlap.running.lock() -= 1;
                Ok(())
            }))
        })
        .collect();
    scheduler.ensure_started().unwrap();

    for handle in &handles {
        handle.join(Some(WAIT)).unwrap();
    }
    assert_eq!(*overlap.max.lock(), 1);
    scheduler.stop();
}

#[test]
fn test_abort_running_job_through_scheduler() {
    let scheduler = scheduler();
    scheduler.ensure_started().unwrap();

    let (started_tx, started_rx) = channel::bounded(1);
    let handle = scheduler.schedule(FnJob::new("long", move |m| {
        started_tx.send(()).unwrap();
        m.announce_total(100);
        let mut done = 0;
        while !m.wait_for_abort(Duration::from_millis(5)) {
            done += 1;
            m.report_progress_absolute(done.min(100));
        }
        Ok(done)
    }));

    started_rx.recv_timeout(WAIT).unwrap();
    scheduler.job(handle.id()).unwrap().abort();
    assert!(handle.result_timeout(WAIT).unwrap_err().is_cancelled());
    handle.join(Some(WAIT)).unwrap();
    assert_eq!(handle.state(), State::Aborted);

    let follow_up = scheduler.schedule(FnJob::new("after abort", |_| Ok(1)));
    assert_eq!(*follow_up.result_timeout(WAIT).unwrap(), 1);
    scheduler.stop();
}

#[test]
fn test_stop_leaves_running_job_and_aborts_queue() {
    let scheduler = scheduler();
    scheduler.ensure_started().unwrap();

    let (started_tx, started_rx) = channel::bounded(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);
    let running = scheduler.schedule(FnJob::new("running", move |_| {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        Ok("finished anyway")
    }));
    started_rx.recv_timeout(WAIT).unwrap();
    let queued = scheduler.schedule(FnJob::new("queued", |_| Ok("never")));

    scheduler.stop();
    assert_eq!(queued.state(), State::Aborted);
    assert_eq!(running.state(), State::Running);

    release_tx.send(()).unwrap();
    assert_eq!(*running.result_timeout(WAIT).unwrap(), "finished anyway");
}

#[test]
fn test_retention_bound() {
    let config = SchedulerConfig {
        retention_limit: 2,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::builder()
        .config(config)
        .log_sink_factory(Arc::new(QuietLogs))
        .id_generator(Arc::new(SequentialIdGenerator::new("r")))
        .build()
        .unwrap();

    for _ in 0..6 {
        scheduler.schedule(FnJob::new("finished", |_| Ok(())));
    }
    while scheduler.execute_next().is_some() {}
    let queued = scheduler.schedule(FnJob::new("still queued", |_| Ok(())));

    let ids: Vec<String> = scheduler.jobs().iter().map(|j| j.id().to_string()).collect();
    assert_eq!(ids, vec!["r-5", "r-6", queued.id()]);
}

#[test]
fn test_listener_observes_full_lifecycle_through_scheduler() {
    #[derive(Default)]
    struct Transitions(Mutex<Vec<(State, State)>>);

    impl JobListener for Transitions {
        fn state_changed(&self, event: &JobEvent) {
            self.0.lock().push((event.old_state(), event.new_state()));
        }
    }

    let scheduler = scheduler();
    let handle = scheduler.schedule(FnJob::new("observed", |_| Ok(())));
    let transitions = Arc::new(Transitions::default());
    handle.add_job_listener(transitions.clone());

    scheduler.execute_next().unwrap();
    assert_eq!(
        *transitions.0.lock(),
        vec![
            (State::Scheduled, State::Starting),
            (State::Starting, State::Running),
            (State::Running, State::Succeeded),
        ]
    );
}

#[test]
fn test_composite_job_through_scheduler() {
    let scheduler = scheduler();
    let composite = CompositeJob::new("pipeline")
        .step(FnJob::new("fetch", |m| {
            m.announce_total(2);
            m.report_progress_increment(2);
            Ok(2usize)
        }))
        .weighted_step(
            2,
            FnJob::new("process", |m| {
                m.announce_total(1);
                m.report_progress_absolute(1);
                Ok("processed")
            }),
        );
    let handle = scheduler.schedule(composite);

    scheduler.execute_next().unwrap();
    let outputs = handle.result().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].downcast_ref::<usize>(), Some(&2));
    assert_eq!(outputs[1].downcast_ref::<&str>(), Some(&"processed"));
    assert_eq!(handle.work_total(), 300);
    assert_eq!(handle.work_done(), 300);
    assert_eq!(handle.state(), State::Succeeded);
}

#[test]
fn test_dropping_scheduler_aborts_queued_jobs() {
    let scheduler = scheduler();
    let first = scheduler.schedule(FnJob::new("queued", |_| Ok(1)));
    let second = scheduler.schedule(FnJob::new("queued too", |_| Ok(2)));

    let waiter = {
        let first = first.clone();
        std::thread::spawn(move || first.result().map(|v| *v))
    };
    drop(scheduler);

    assert!(waiter.join().unwrap().unwrap_err().is_cancelled());
    assert!(second.result_timeout(WAIT).unwrap_err().is_cancelled());
    second.join(Some(WAIT)).unwrap();
    assert_eq!(first.state(), State::Aborted);
    assert_eq!(second.state(), State::Aborted);
}

#[test]
fn test_dropping_started_scheduler_aborts_queued_jobs() {
    let scheduler = scheduler();
    scheduler.ensure_started().unwrap();

    let (started_tx, started_rx) = channel::bounded(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);
    let running = scheduler.schedule(FnJob::new("running", move |_| {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        Ok("done")
    }));
    started_rx.recv_timeout(WAIT).unwrap();
    let queued = scheduler.schedule(FnJob::new("queued", |_| Ok("never")));

    drop(scheduler);
    assert!(queued.result_timeout(WAIT).unwrap_err().is_cancelled());

    release_tx.send(()).unwrap();
    assert_eq!(*running.result_timeout(WAIT).unwrap(), "done");
}

#[test]
fn test_panicking_listener_does_not_hide_terminal_event() {
    struct ExplodesOnRunning;

    impl JobListener for ExplodesOnRunning {
        fn state_changed(&self, event: &JobEvent) {
            if event.new_state() == State::Running {
                panic!("listener exploded");
            }
        }
    }

    #[derive(Default)]
    struct Transitions(Mutex<Vec<String>>);

    impl JobListener for Transitions {
        fn state_changed(&self, event: &JobEvent) {
            self.0
                .lock()
                .push(format!("{} -> {}", event.old_state(), event.new_state()));
        }
    }

    let scheduler = scheduler();
    let handle = scheduler.schedule(FnJob::new("observed", |_| Ok(())));
    handle.add_job_listener(Arc::new(ExplodesOnRunning));
    let transitions = Arc::new(Transitions::default());
    handle.add_job_listener(transitions.clone());
    let next = scheduler.schedule(FnJob::new("next", |_| Ok("fine")));

    scheduler.execute_next().unwrap();
    assert_eq!(handle.state(), State::Failed);
    assert_eq!(
        *transitions.0.lock(),
        vec![
            "SCHEDULED -> STARTING",
            "STARTING -> RUNNING",
            "RUNNING -> FAILED",
        ]
    );

    scheduler.execute_next().unwrap();
    assert_eq!(*next.result().unwrap(), "fine");
    assert!(scheduler.is_idle());
}

#[test]
fn test_custom_execution_units() {
    #[derive(Default)]
    struct CountingUnits {
        created: AtomicUsize,
    }

    impl ExecutionUnitFactory for CountingUnits {
        fn create_unit(&self, task: ThreadTask) -> Arc<dyn ExecutionUnit> {
            self.created.fetch_add(1, Ordering::SeqCst);
            OnceUnitFactory.create_unit(task)
        }
    }

    init_tracing();
    let units = Arc::new(CountingUnits::default());
    let scheduler = Scheduler::builder()
        .log_sink_factory(Arc::new(QuietLogs))
        .execution_unit_factory(units.clone())
        .build()
        .unwrap();

    let ran = scheduler.schedule(FnJob::new("runs", |_| Ok(1)));
    let aborted = scheduler.schedule(FnJob::new("aborted", |_| Ok(2)));
    assert_eq!(units.created.load(Ordering::SeqCst), 2);

    aborted.abort();
    while scheduler.execute_next().is_some() {}
    assert_eq!(*ran.result().unwrap(), 1);
    assert!(aborted.result().unwrap_err().is_cancelled());
}
