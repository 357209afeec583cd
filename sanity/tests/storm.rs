use sanity::*;
use rethook::THUNKS_PER_PAGE;

#[test]
fn single_thread_storm() {
    let cfg = StormConfig {
        rounds:             20,
        max_depth:          40,
        max_fanout:         3,
        calls_per_round:    300,
        seed:               7,
    };
    let report = run_storm(&cfg, cfg.seed).unwrap();
    assert!(report.calls >= cfg.rounds);
    assert!(report.deepest <= cfg.max_depth as usize);
    assert_eq!(report.distinct, report.deepest + 1);
    assert_eq!(report.pages, 1);
}

#[test]
fn storm_crosses_pages() {
    let cfg = StormConfig {
        rounds:             40,
        max_depth:          (THUNKS_PER_PAGE + 30) as u64,
        max_fanout:         2,
        calls_per_round:    200,
        seed:               11,
    };
    let report = run_storm(&cfg, cfg.seed).unwrap();
    assert!(report.deepest >= THUNKS_PER_PAGE);
    assert_eq!(report.pages, 2);
}

#[test]
fn same_seed_same_storm() {
    let cfg = StormConfig { rounds: 5, ..StormConfig::default() };
    let one = run_storm(&cfg, 3).unwrap();
    let two = run_storm(&cfg, 3).unwrap();
    assert_eq!(one.calls, two.calls);
    assert_eq!(one.deepest, two.deepest);
    assert_eq!(one.pages, two.pages);
}

#[test]
fn parallel_storms_stay_apart() {
    let cfg = StormConfig { rounds: 10, calls_per_round: 500, ..StormConfig::default() };
    let reports = run_storms(&cfg, 4).unwrap();
    assert_eq!(reports.len(), 4);
    for report in reports {
        assert_eq!(report.distinct, report.deepest + 1);
    }
}
