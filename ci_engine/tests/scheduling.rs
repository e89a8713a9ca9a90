//! Scheduler timing: stable sets, filters, periodic triggers, checkout delay.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ci_engine::models::builder::{AgentConfig, BuilderConfig};
use ci_engine::services::filter::ChangeFilter;
use ci_engine::services::resolver::{RepositoryKind, SourceStampResolver};
use ci_engine::services::scheduler::SchedulerDefinition;
use ci_engine::{BuildMaster, BuildStatus, Error, MasterSetup, NewChange, Revision};
use common::{created, finished, FakeSource, ScriptedAgent};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, Instant};

const WINDOW: Duration = Duration::from_secs(600);

fn setup(schedulers: Vec<SchedulerDefinition>) -> MasterSetup {
    let mut setup = MasterSetup::new()
        .agent(AgentConfig::new("linux-1"))
        .builder(BuilderConfig::new("full", &["linux-1"]));
    setup.schedulers = schedulers;
    setup
}

fn start(schedulers: Vec<SchedulerDefinition>) -> (BuildMaster, Arc<ScriptedAgent>) {
    let master = BuildMaster::start(setup(schedulers), Arc::new(FakeSource::default())).unwrap();
    let agent = Arc::new(ScriptedAgent::new("linux-1", BuildStatus::Success));
    master.attach_agent(agent.clone()).unwrap();
    (master, agent)
}

fn on_main(who: &str) -> NewChange {
    NewChange::new(who).on_branch("main")
}

fn secs_since(start: Instant) -> u64 {
    Instant::now().duration_since(start).as_secs()
}

#[tokio::test(start_paused = true)]
async fn burst_fires_once_after_the_window_goes_quiet() {
    let (master, _agent) = start(vec![SchedulerDefinition::change_triggered(
        "main",
        &["full"],
        ChangeFilter::branch("main"),
        WINDOW,
    )]);
    let mut events = master.subscribe_build_sets();
    let t0 = Instant::now();

    master.add_change(on_main("ann")).unwrap();
    sleep(Duration::from_secs(240)).await;
    master.add_change(on_main("bob")).unwrap();
    sleep(Duration::from_secs(300)).await;
    master.add_change(on_main("cat")).unwrap();

    let first = created(&mut events).await;
    assert_eq!(secs_since(t0), 1140);

    let notice = finished(&mut events, first).await;
    assert_eq!(notice.source.changes.len(), 3);
    let blamelist: BTreeSet<String> = ["ann", "bob", "cat"].map(String::from).into();
    assert_eq!(notice.blamelist, blamelist);

    // A change after the set fired starts an independent set.
    let wait = Duration::from_secs(1200 - secs_since(t0));
    sleep(wait).await;
    master.add_change(on_main("dan")).unwrap();
    let second = created(&mut events).await;
    assert_ne!(first, second);
    assert_eq!(secs_since(t0), 1800);

    let notice = finished(&mut events, second).await;
    assert_eq!(notice.source.changes.len(), 1);
    assert_eq!(notice.source.changes[0].who, "dan");
}

#[tokio::test(start_paused = true)]
async fn filtered_changes_do_not_reset_the_timer() {
    let (master, _agent) = start(vec![
        SchedulerDefinition::change_triggered(
            "main",
            &["full"],
            ChangeFilter::branch("main"),
            WINDOW,
        ),
        SchedulerDefinition::change_triggered(
            "docs",
            &["full"],
            |c: &ci_engine::Change| c.files.iter().any(|f| f.starts_with("docs/")),
            WINDOW,
        ),
    ]);
    let mut events = master.subscribe_build_sets();
    let t0 = Instant::now();

    master.add_change(on_main("ann").with_files(["src/lib.rs"])).unwrap();
    sleep(Duration::from_secs(500)).await;
    master
        .add_change(NewChange::new("bob").with_files(["docs/index.md"]))
        .unwrap();

    let main_set = created(&mut events).await;
    assert_eq!(secs_since(t0), 600);
    let docs_set = created(&mut events).await;
    assert_eq!(secs_since(t0), 1100);

    let main = master.build_set(main_set).unwrap();
    assert_eq!(main.scheduler.as_deref(), Some("main"));
    assert_eq!(main.source.changes.len(), 1);
    let docs = master.build_set(docs_set).unwrap();
    assert_eq!(docs.scheduler.as_deref(), Some("docs"));
    assert_eq!(docs.source.changes[0].who, "bob");
}

#[tokio::test(start_paused = true)]
async fn timestamp_repositories_build_at_last_change_plus_checkout_delay() {
    let resolver = SourceStampResolver::for_window(RepositoryKind::TimestampOnly, WINDOW, None);
    let (master, agent) = start(vec![SchedulerDefinition::change_triggered(
        "main",
        &["full"],
        ChangeFilter::branch("main"),
        WINDOW,
    )
    .with_resolver(resolver)]);
    let mut events = master.subscribe_build_sets();

    let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    master.add_change(on_main("ann").at(base)).unwrap();
    master
        .add_change(on_main("bob").at(base + chrono::Duration::seconds(540)))
        .unwrap();

    let id = created(&mut events).await;
    finished(&mut events, id).await;

    let specs = agent.specs.lock();
    assert_eq!(specs.len(), 1);
    assert_eq!(
        specs[0].source.revision,
        Some(Revision::Timestamp(base + chrono::Duration::seconds(840)))
    );
}

#[tokio::test(start_paused = true)]
async fn periodic_scheduler_builds_latest_on_its_branch() {
    let (master, agent) = start(vec![SchedulerDefinition::periodic(
        "hourly",
        &["full"],
        Duration::from_secs(3600),
        Some("release".into()),
    )]);
    let mut events = master.subscribe_build_sets();
    let t0 = Instant::now();

    let first = created(&mut events).await;
    assert_eq!(secs_since(t0), 3600);
    finished(&mut events, first).await;
    let second = created(&mut events).await;
    assert_eq!(secs_since(t0), 7200);
    finished(&mut events, second).await;

    let specs = agent.specs.lock();
    assert_eq!(specs.len(), 2);
    assert!(specs[0].source.is_latest());
    assert_eq!(specs[0].source.branch.as_deref(), Some("release"));
    assert_eq!(specs[0].properties["scheduler"], "hourly");
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_pending_stable_sets() {
    let (master, agent) = start(vec![SchedulerDefinition::change_triggered(
        "main",
        &["full"],
        ChangeFilter::branch("main"),
        WINDOW,
    )]);
    let mut events = master.subscribe_build_sets();

    master.add_change(on_main("ann")).unwrap();
    sleep(Duration::from_secs(60)).await;
    master.shutdown().await;
    sleep(Duration::from_secs(3600)).await;

    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(agent.builds(), 0);
    assert!(matches!(
        master.add_change(on_main("bob")),
        Err(Error::ShuttingDown)
    ));
}
