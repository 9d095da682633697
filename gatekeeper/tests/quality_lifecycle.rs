//! End-to-end scenarios across validator, registry, enforcement, injection, and the verify loop.

use std::sync::Arc;

use gatekeeper::core::clock::{Clock, ManualClock};
use gatekeeper::core::enforcement::{GateEnforcementAuthority, RecoveryAction, ReviewOutcome};
use gatekeeper::core::types::{EnforcementMode, PassCriterion, ValidationContext};
use gatekeeper::gates::provider::InMemoryGateProvider;
use gatekeeper::gates::temporary::{GateScope, NewTemporaryGate, RegistryConfig, TemporaryGateRegistry};
use gatekeeper::gates::validator::GateValidator;
use gatekeeper::injection::decision::InjectionDecisionService;
use gatekeeper::injection::overrides::SessionOverrideManager;
use gatekeeper::injection::types::{
    DecisionSource, Frequency, FrequencyMode, InjectionConfig, InjectionContext, InjectionType, PartialRule,
};
use gatekeeper::io::checkpoint::GitCheckpoint;
use gatekeeper::io::git::Git;
use gatekeeper::io::shell_verify::{ShellVerifyConfig, ShellVerifyExecutor};
use gatekeeper::io::verify_state::VerifyActiveStateManager;
use gatekeeper::test_support::{TestRepo, shell_gate};
use gatekeeper::verify_loop::{AttemptOutcome, ShellVerifyLoop};

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(1_000_000))
}

/// A failing shell gate retries up to the ceiling, then waits for a user decision.
#[test]
fn shell_verify_gate_drives_enforcement_to_exhaustion_and_recovery() {
    let clock = manual_clock();
    let mut gate = shell_gate("tests", "echo '2 failed' >&2; exit 1");
    gate.guidance = "Make the test suite pass.".to_string();
    gate.retry_config.max_attempts = 2;
    let validator = GateValidator::new(
        Arc::new(InMemoryGateProvider::with_gates(vec![gate])),
        Arc::new(ShellVerifyExecutor::default()),
        clock.clone(),
    );
    let authority = GateEnforcementAuthority::new(clock);
    authority.open_review("s1", vec!["tests".to_string()], "Run the suite", 2, EnforcementMode::Blocking);

    let ctx = ValidationContext::for_content("step output");
    let results = validator.validate_gates(&["tests".to_string()], &ctx);
    assert!(!results[0].passed);
    assert_eq!(results[0].checks[0].details["exit_code"], 1);
    assert!(results[0].retry_hints[1].contains("2 failed"));
    assert!(validator.should_retry(&results, 1, 2));

    assert!(matches!(
        authority.record_validation("s1", &results).expect("first"),
        ReviewOutcome::RetryRequired { attempt: 1, .. }
    ));
    assert!(!authority.continuation("s1").may_continue);
    assert!(matches!(
        authority.record_validation("s1", &results).expect("second"),
        ReviewOutcome::Exhausted { attempts: 2, .. }
    ));
    assert!(authority.record_validation("s1", &results).is_err());

    assert!(matches!(
        authority.resolve("s1", RecoveryAction::Skip).expect("skip"),
        ReviewOutcome::Cleared { .. }
    ));
    assert!(authority.continuation("s1").may_continue);
    assert_eq!(validator.statistics().failed_validations, 1);
}

/// Cleaning up chain A leaves chain B's gates intact.
#[test]
fn chain_cleanup_is_isolated() {
    let clock = manual_clock();
    let registry = Arc::new(TemporaryGateRegistry::new(clock.clone(), RegistryConfig::default()));
    let create = |name: &str, scope: GateScope, scope_id: &str| {
        let mut request = NewTemporaryGate::new(name, scope);
        request.pass_criteria.push(PassCriterion::ShellVerify {
            command: "exit 0".to_string(),
            timeout_ms: None,
            working_dir: None,
            env: Default::default(),
            preset: None,
        });
        registry.create_temporary_gate(request, Some(scope_id)).expect("create")
    };
    let a_chain = create("a", GateScope::Chain, "chain-a");
    let a_step = create("a-step", GateScope::Step, "chain-a:2");
    let b_chain = create("b", GateScope::Chain, "chain-b");
    let b_step = create("b-step", GateScope::Step, "chain-b:2");

    assert_eq!(registry.cleanup_chain_execution("chain-a"), 2);
    assert!(registry.get_temporary_gate(&a_chain).is_none());
    assert!(registry.get_temporary_gate(&a_step).is_none());
    assert!(registry.get_temporary_gate(&b_chain).is_some());
    assert!(registry.get_temporary_gate(&b_step).is_some());

    let validator = GateValidator::new(
        Arc::new(registry.as_gate_provider()),
        Arc::new(ShellVerifyExecutor::default()),
        clock.clone(),
    );
    let result = validator
        .validate_gate(&b_chain, &ValidationContext::default())
        .expect("temporary gate validates");
    assert!(result.passed);
    assert!(validator.validate_gate(&a_chain, &ValidationContext::default()).is_none());

    clock.advance_ms(RegistryConfig::default().default_ttl_ms.expect("ttl"));
    assert!(registry.get_temporary_gate(&b_chain).is_none());
    assert_eq!(registry.cleanup_expired_gates(), 2);
    assert_eq!(registry.cleanup_expired_gates(), 0);
}

/// `first-only` injects on step 1 and nowhere else; a session override still wins.
#[test]
fn first_only_system_prompt_across_a_three_step_chain() {
    let clock: Arc<dyn Clock> = manual_clock();
    let mut config = InjectionConfig::default();
    config.global.set(
        InjectionType::SystemPrompt,
        PartialRule {
            enabled: Some(true),
            frequency: Some(Frequency {
                mode: FrequencyMode::FirstOnly,
                interval: None,
            }),
            ..PartialRule::default()
        },
    );
    let overrides = Arc::new(SessionOverrideManager::new(clock.clone()));
    let service = InjectionDecisionService::new(config, overrides, clock);

    let decisions: Vec<_> = (1..=3)
        .map(|step| {
            let mut ctx = InjectionContext::new("run-1", step);
            ctx.total_steps = Some(3);
            service.decide(InjectionType::SystemPrompt, &ctx)
        })
        .collect();
    assert_eq!(
        decisions.iter().map(|d| d.inject).collect::<Vec<_>>(),
        vec![true, false, false]
    );
    assert!(decisions.iter().all(|d| d.source == DecisionSource::GlobalConfig));

    // Gate guidance has no rule at all and falls through to the default.
    let gate = service.decide(InjectionType::GateGuidance, &InjectionContext::new("run-1", 2));
    assert_eq!((gate.inject, gate.source), (true, DecisionSource::SystemDefault));
}

/// Real command plus real git: a failing attempt restores tracked files, a passing one clears state.
#[test]
fn verify_loop_with_checkpoint_rollback_in_a_real_repo() {
    let repo = TestRepo::new().expect("repo");
    repo.write("value.txt", "ok\n").expect("write");
    repo.commit_all("init").expect("commit");

    let clock = manual_clock();
    let state_dir = tempfile::tempdir().expect("tempdir");
    let verify_loop = ShellVerifyLoop::new(
        Arc::new(ShellVerifyExecutor::default()),
        VerifyActiveStateManager::under(state_dir.path()),
        clock.clone(),
    )
    .with_checkpoints(GitCheckpoint::new(Git::new(repo.path()), clock));

    let mut config = ShellVerifyConfig::new("grep -q ok value.txt");
    config.working_dir = Some(repo.path().to_path_buf());
    config.loop_mode = true;
    config.checkpoint = true;
    config.rollback = true;
    config.max_iterations = Some(3);
    verify_loop.begin("s", config).expect("begin");

    repo.write("value.txt", "broken\n").expect("write");
    let outcome = verify_loop.attempt("s").expect("attempt");
    assert!(matches!(outcome, AttemptOutcome::Retry { rolled_back: true, .. }));
    // Rollback restores the pre-attempt state, which already held the broken edit.
    assert_eq!(repo.read("value.txt").expect("read"), "broken\n");
    assert!(verify_loop.state_file().is_active());

    repo.write("value.txt", "ok again\n").expect("write");
    assert!(verify_loop.attempt("s").expect("attempt").passed());
    assert!(!verify_loop.state_file().is_active());
    assert!(Git::new(repo.path()).stash_list().expect("stash list").is_empty());
}
