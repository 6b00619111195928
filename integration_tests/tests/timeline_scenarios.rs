mod common;

use common::{connected_session, drain_commands, model_state, x_series, ScriptedServer};
use serde_json::json;
use timeline_core::{DispatchError, DispatchOutcome, StepOutcome, TimelineError, TimelinePhase};
use viz_proto::ClientCommand;

#[test]
fn two_replicas_accumulate_independently() {
    let (mut session, commands) = connected_session();
    assert_eq!(drain_commands(&commands), vec![ClientCommand::Reset {}]);

    session.dispatch(&common::chart_specs(2));
    session.dispatch(&model_state(0, &[1, 2]));
    assert_eq!(x_series(&session, 0, 0), vec![Some(1.0)]);
    assert_eq!(x_series(&session, 1, 0), vec![Some(2.0)]);

    session.dispatch(&model_state(1, &[5, 7]));
    assert_eq!(x_series(&session, 0, 1), vec![Some(1.0), Some(5.0)]);
    assert_eq!(x_series(&session, 1, 1), vec![Some(2.0), Some(7.0)]);
    assert_eq!(session.timeline().live_step(), Some(1));
    assert_eq!(session.timeline().display_step(), Some(1));
}

#[test]
fn scrubbing_back_decouples_display_from_live() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(1);
    server.open(&mut session);
    server.serve(&mut session, &commands);

    session.dispatch(&server.state_for(1));
    assert_eq!(session.timeline().display_step(), Some(1));

    session.set_display_step(0).expect("scrub to start");
    session.dispatch(&server.state_for(2));
    assert_eq!(session.timeline().display_step(), Some(0));
    assert_eq!(session.timeline().live_step(), Some(2));

    session.jump_to_live().expect("jump");
    session.dispatch(&server.state_for(3));
    assert_eq!(session.timeline().display_step(), Some(3));
}

#[test]
fn duplicate_frames_keep_stored_entities() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(2);
    server.open(&mut session);
    server.serve(&mut session, &commands);
    session.dispatch(&server.state_for(1));
    let before = session.timeline().store().get_by_step(1, 1).cloned();

    let outcome = session.dispatch(&server.state_for(1));
    assert!(matches!(
        outcome,
        DispatchOutcome::Step(StepOutcome::Redelivered { step: 1, changed: false })
    ));
    let after = session.timeline().store().get_by_step(1, 1).cloned();
    match (before, after) {
        (Some(before), Some(after)) => assert!(std::sync::Arc::ptr_eq(&before, &after)),
        other => panic!("step 1 missing: {other:?}"),
    }
}

#[test]
fn far_ahead_frames_are_rejected_without_disturbing_the_run() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(1);
    server.open(&mut session);
    server.serve(&mut session, &commands);

    let outcome = session.dispatch(&server.state_for(500_000));
    assert!(matches!(
        outcome,
        DispatchOutcome::Rejected(DispatchError::Timeline(TimelineError::TooFarAhead {
            step: 500_000,
            awaiting: 1
        }))
    ));
    assert_eq!(session.timeline().buffered_steps(), 0);
    session.dispatch(&server.state_for(1));
    assert_eq!(session.timeline().live_step(), Some(1));
}

#[test]
fn every_applied_step_is_addressable() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(3);
    server.open(&mut session);
    server.serve(&mut session, &commands);
    for step in 1..=9 {
        session.dispatch(&server.state_for(step));
    }

    for replica in 0..3 {
        let range = session.timeline().store().get_range(replica, 0, 9);
        let steps: Vec<u64> = range.iter().map(|entity| entity.step()).collect();
        assert_eq!(steps, (0..=9).collect::<Vec<_>>());
        for entity in &range {
            assert_eq!(entity.series().len() as u64, entity.step() + 1);
        }
    }
}

#[test]
fn reset_from_any_state_clears_the_run() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(2);
    server.open(&mut session);
    server.serve(&mut session, &commands);
    for step in 1..=4 {
        session.dispatch(&server.state_for(step));
    }
    session.set_display_step(2).expect("scrub");

    assert!(session.reset());
    assert_eq!(session.timeline().phase(), TimelinePhase::Uninitialized);
    assert_eq!(session.timeline().live_step(), None);
    assert_eq!(session.timeline().display_step(), None);
    assert_eq!(session.timeline().replica_count(), 0);

    // A response to a request made before the reset.
    let stale = session.dispatch(&server.state_for(5));
    assert!(matches!(stale, DispatchOutcome::StaleDropped { step: 5 }));

    server.serve(&mut session, &commands);
    assert_eq!(session.timeline().replica_count(), 2);
    assert_eq!(session.timeline().live_step(), Some(0));
    assert_eq!(session.timeline().display_step(), Some(0));
    assert_eq!(x_series(&session, 1, 0), vec![Some(1.0)]);
    assert_eq!(session.parameters(), &[json!({"name": "density"})]);
}

#[test]
fn out_of_order_delivery_is_reassembled() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(1);
    server.open(&mut session);
    server.serve(&mut session, &commands);

    let late = session.dispatch(&server.state_for(2));
    assert!(matches!(
        late,
        DispatchOutcome::Step(StepOutcome::Buffered { step: 2, awaiting: 1 })
    ));
    session.dispatch(&server.state_for(1));
    assert_eq!(session.timeline().live_step(), Some(2));
    assert_eq!(
        x_series(&session, 0, 2),
        vec![Some(0.0), Some(10.0), Some(20.0)]
    );
    assert_eq!(session.metrics().buffered_steps, 1);
    assert_eq!(session.metrics().steps_applied, 3);
}

#[test]
fn method_call_rewrites_the_current_step() {
    let (mut session, commands) = connected_session();
    let mut server = ScriptedServer::new(2);
    server.open(&mut session);
    server.serve(&mut session, &commands);
    for step in 1..=3 {
        session.advance(std::time::Instant::now());
        server.serve(&mut session, &commands);
        assert_eq!(session.timeline().live_step(), Some(step));
    }

    let mut data = serde_json::Map::new();
    data.insert("x".into(), json!(-5));
    session.call_method(1, data).expect("method call sent");
    server.serve(&mut session, &commands);

    assert_eq!(session.timeline().live_step(), Some(3));
    assert_eq!(
        x_series(&session, 1, 3),
        vec![Some(1.0), Some(11.0), Some(21.0), Some(-5.0)]
    );
    assert_eq!(
        x_series(&session, 0, 3),
        vec![Some(0.0), Some(10.0), Some(20.0), Some(30.0)]
    );
    assert_eq!(session.metrics().divergent_redeliveries, 1);
}
