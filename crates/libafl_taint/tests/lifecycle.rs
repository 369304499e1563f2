mod common;

use std::{cell::RefCell, rc::Rc};

use common::{init_logger, TestHost};
use libafl_taint::{
    addr::{make_laddr, make_maddr, Address},
    host::HookKind,
    ir::{CodeUnit, IrOp, Value},
    TaintConfig, TaintEngine, TaintState,
};

fn copy_block(id: u64) -> CodeUnit {
    CodeUnit::block(
        id,
        0x4000 + id * 0x10,
        vec![
            IrOp::Load {
                dst: Value::Local(0),
                addr: Value::GlobalReg(0),
                size: 1,
            },
            IrOp::Store {
                src: Value::Local(0),
                addr: Value::GlobalReg(1),
                size: 1,
            },
        ],
    )
}

fn enabled_engine(host: &mut TestHost) -> TaintEngine {
    init_logger();
    let mut engine = TaintEngine::new(TaintConfig::default());
    engine.init(host);
    engine.enable(host);
    engine
}

#[test]
fn test_init_and_enable_configure_host() {
    let mut host = TestHost::with_units(vec![
        copy_block(1),
        CodeUnit::helper(2, Vec::new()),
        CodeUnit::declaration(3),
    ]);
    let engine = enabled_engine(&mut host);

    assert_eq!(engine.state(), TaintState::Enabled);
    assert!(engine.is_enabled());
    assert!(host.precise_pc);
    assert!(host.instrumented);
    assert!(host.helpers);
    assert!(host.memory_callbacks);
    assert!(!host.block_chaining);
    for hook in HookKind::TRACKING {
        assert!(host.hooks.contains(&hook));
    }
    assert!(host.hooks.contains(&HookKind::AfterBlockExec));
    assert!(host.hooks.contains(&HookKind::GuestHypercall));
    assert_eq!(engine.instrumented_units(), 2);
    assert_eq!(engine.num_labels_applied(), 0);
}

#[test]
fn test_enable_is_idempotent() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);
    engine.label_ram(0x10, 1).unwrap();
    // A second registration of any hook would trip the test host.
    engine.enable(&mut host);
    assert_eq!(engine.query_ram(0x10).unwrap(), 1);
}

#[test]
fn test_block_executes_taint_program() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);
    engine.label_ram(0x100, 3).unwrap();

    assert!(!engine.before_block_exec_invalidate(1));
    engine.phys_mem_before_read(0x100, 1);
    engine.phys_mem_before_write(0x200, 1);
    engine.run_block_taint(1).unwrap();
    engine.after_block_exec(&mut host, 1);

    assert_eq!(engine.query_labels_ram(0x200).unwrap(), vec![3]);
    assert_eq!(engine.query_laddr(0, 0).unwrap(), 1);
    assert_eq!(engine.state(), TaintState::Enabled);
}

#[test]
fn test_unknown_op_on_constants_untaints_dst() {
    let block = CodeUnit::block(
        5,
        0x5000,
        vec![IrOp::Other {
            name: "cpuid".into(),
            dst: Some(Value::Local(1)),
            srcs: vec![Value::Const(0)],
            size: 4,
        }],
    );
    let mut host = TestHost::with_units(vec![block]);
    let mut engine = enabled_engine(&mut host);
    for offset in 0..4 {
        engine.label(make_laddr(1, offset), 3).unwrap();
    }

    engine.run_block_taint(5).unwrap();
    for offset in 0..4 {
        assert_eq!(engine.query_laddr(1, offset).unwrap(), 0);
    }
}

#[test]
fn test_new_unit_is_retranslated_then_instrumented() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);

    host.module.add(copy_block(2));
    assert!(engine.before_block_exec_invalidate(2));
    engine.after_block_translate(&mut host, 2);
    assert!(!engine.before_block_exec_invalidate(2));
    assert_eq!(engine.instrumented_units(), 2);

    // Unknown units are left alone.
    engine.after_block_translate(&mut host, 42);
    assert_eq!(engine.instrumented_units(), 2);
}

#[test]
fn test_disable_mid_block_keeps_block_instrumented() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);

    let changes = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&changes);
    engine.add_taint_change_observer(move |addr: Address, len: u64| log.borrow_mut().push((addr, len)));
    engine.label_ram(0x100, 3).unwrap();

    assert!(!engine.before_block_exec_invalidate(1));
    engine.phys_mem_before_read(0x100, 1);
    engine.request_disable();
    assert_eq!(engine.state(), TaintState::DisablePending);
    assert!(engine.is_enabled());
    engine.phys_mem_before_write(0x200, 1);
    engine.run_block_taint(1).unwrap();

    // The rest of the block still propagated.
    assert_eq!(engine.query_labels_ram(0x200).unwrap(), vec![3]);

    engine.after_block_exec(&mut host, 1);
    assert_eq!(engine.state(), TaintState::Disabled);
    assert!(!engine.is_enabled());
    assert!(engine.shadow().is_err());
    assert!(engine.query_ram(0x200).is_err());
    assert!(!host.instrumented);
    assert!(!host.helpers);
    assert!(!host.memory_callbacks);
    assert_eq!(host.flushes, 1);
    for hook in HookKind::TRACKING {
        assert!(!host.hooks.contains(&hook));
    }
    assert_eq!(engine.instrumented_units(), 0);
    assert!(changes.borrow().contains(&(make_maddr(0x200), 1)));
}

#[test]
fn test_reenable_gives_fresh_state() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);
    engine.label_ram(0x100, 3).unwrap();
    assert_eq!(engine.num_labels_applied(), 1);

    engine.request_disable();
    engine.after_block_exec(&mut host, 1);
    engine.enable(&mut host);

    assert_eq!(engine.state(), TaintState::Enabled);
    assert_eq!(engine.query_ram(0x100).unwrap(), 0);
    assert_eq!(engine.num_labels_applied(), 0);
    assert!(host.memory_callbacks);
    assert_eq!(engine.instrumented_units(), 1);
}

#[test]
fn test_enable_cancels_pending_disable() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);
    engine.label_ram(0x100, 3).unwrap();

    engine.request_disable();
    engine.enable(&mut host);
    assert_eq!(engine.state(), TaintState::Enabled);
    engine.after_block_exec(&mut host, 1);
    assert_eq!(engine.state(), TaintState::Enabled);
    assert_eq!(engine.query_ram(0x100).unwrap(), 1);
    assert_eq!(host.flushes, 0);
}

#[test]
fn test_observers_survive_reenable() {
    let mut host = TestHost::with_units(Vec::new());
    init_logger();
    let mut engine = TaintEngine::default();
    engine.init(&mut host);

    let changes = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&changes);
    engine.add_taint_change_observer(move |addr: Address, len: u64| log.borrow_mut().push((addr, len)));

    engine.enable(&mut host);
    engine.label_ram(0x10, 1).unwrap();
    engine.request_disable();
    engine.after_block_exec(&mut host, 0);
    engine.enable(&mut host);
    engine.label_ram(0x20, 2).unwrap();

    assert_eq!(
        *changes.borrow(),
        vec![(make_maddr(0x10), 1), (make_maddr(0x20), 1)]
    );
}

#[test]
fn test_memlog_reset_at_boundaries() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);
    engine.label_ram(0x100, 3).unwrap();

    // Accesses of an earlier block must not leak into this one.
    engine.phys_mem_before_read(0x999, 1);
    engine.asid_changed(0x1000, 0x2000);
    assert!(!engine.before_block_exec_invalidate(1));
    engine.phys_mem_before_read(0x100, 1);
    engine.phys_mem_before_write(0x300, 1);
    engine.run_block_taint(1).unwrap();
    assert_eq!(engine.query_ram(0x300).unwrap(), 1);

    // Out of sync: the store has no recorded address.
    engine.phys_mem_before_read(0x100, 1);
    assert!(engine.run_block_taint(1).is_err());
}

#[test]
fn test_uninit_restores_host() {
    let mut host = TestHost::with_units(vec![copy_block(1)]);
    let mut engine = enabled_engine(&mut host);
    engine.uninit(&mut host);

    assert_eq!(engine.state(), TaintState::Disabled);
    assert!(host.hooks.is_empty());
    assert!(!host.instrumented);
    assert!(!host.memory_callbacks);
    assert!(host.block_chaining);
}

#[test]
#[should_panic(expected = "unverified taint instrumentation")]
fn test_verification_failure_is_fatal() {
    let mut host = TestHost::with_units(vec![CodeUnit::block(
        1,
        0x4000,
        vec![IrOp::Move {
            dst: Value::Local(6000),
            src: Value::GlobalReg(0),
            size: 4,
        }],
    )]);
    enabled_engine(&mut host);
}
