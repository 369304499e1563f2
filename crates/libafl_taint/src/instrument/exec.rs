//! Runs installed taint programs against the shadow state.
use log::trace;

use crate::{
    addr::make_maddr,
    instrument::{Operand, TaintOp},
    labels::LabelSet,
    memlog::TaintMemlog,
    shadow::ShadowState,
    Error,
};

fn union_of(shadow: &ShadowState, operands: &[Operand]) -> LabelSet {
    let mut out = LabelSet::new();
    for operand in operands {
        for labels in shadow.read(operand.addr, operand.size) {
            out.union_with(&labels);
        }
    }
    out
}

fn mix_pointer(shadow: &ShadowState, labels: &mut [LabelSet], ptr: Option<&Operand>) {
    if let Some(ptr) = ptr {
        let ptr_labels = union_of(shadow, core::slice::from_ref(ptr));
        if !ptr_labels.is_empty() {
            labels.iter_mut().for_each(|l| l.union_with(&ptr_labels));
        }
    }
}

fn next_access(memlog: &mut TaintMemlog, op: &TaintOp) -> Result<u64, Error> {
    memlog.pop().ok_or_else(|| {
        Error::illegal_state(format!(
            "No memory access recorded for {op:?}, memlog and instrumentation are out of sync"
        ))
    })
}

/// Executes one taint op.
pub fn execute_op(
    op: &TaintOp,
    shadow: &mut ShadowState,
    memlog: &mut TaintMemlog,
) -> Result<(), Error> {
    match op {
        TaintOp::Copy { dst, src, size } => {
            if !shadow.fits(*dst, *size) {
                return Err(Error::out_of_bounds(*dst, *size));
            }
            let labels = shadow.read(*src, *size);
            shadow.write(*dst, &labels)
        }
        TaintOp::Mix { dst, srcs, size } => {
            let labels = union_of(shadow, srcs);
            shadow.fill(*dst, *size, &labels)
        }
        TaintOp::Delete { dst, size } => shadow.delete(*dst, *size),
        TaintOp::LoadMem { dst, size, ptr } => {
            let pa = next_access(memlog, op)?;
            let Some(dst) = dst else {
                return Ok(());
            };
            let mut labels = shadow.read(make_maddr(pa), *size);
            mix_pointer(shadow, &mut labels, ptr.as_ref());
            shadow.write(*dst, &labels)
        }
        TaintOp::StoreMem { src, size, ptr } => {
            let pa = next_access(memlog, op)?;
            let mut labels = match src {
                Some(src) => shadow.read(*src, *size),
                None => vec![LabelSet::new(); usize::try_from(*size).unwrap_or_default()],
            };
            mix_pointer(shadow, &mut labels, ptr.as_ref());
            shadow.write(make_maddr(pa), &labels)
        }
        TaintOp::Call {
            args, ret, size, ..
        } => match ret {
            Some(ret) => {
                let labels = union_of(shadow, args);
                shadow.fill(*ret, *size, &labels)
            }
            None => Ok(()),
        },
    }
}

/// Executes a whole program, consuming the memlog in program order.
pub fn execute(
    ops: &[TaintOp],
    shadow: &mut ShadowState,
    memlog: &mut TaintMemlog,
    debug: bool,
) -> Result<(), Error> {
    for op in ops {
        if debug {
            trace!("taint op: {op:?}");
        }
        execute_op(op, shadow, memlog)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addr::{make_greg, make_laddr},
        shadow::{ShadowLayout, TaintObservers},
    };

    fn shadow() -> ShadowState {
        ShadowState::new(&ShadowLayout::default(), TaintObservers::new())
    }

    #[test]
    fn test_load_follows_memlog_order() {
        let mut shadow = shadow();
        shadow.label(make_maddr(0x10), 1).unwrap();
        shadow.label(make_maddr(0x20), 2).unwrap();
        let mut memlog = TaintMemlog::new();
        memlog.push(0x20);
        memlog.push(0x10);

        let ops = [
            TaintOp::LoadMem {
                dst: Some(make_laddr(0, 0)),
                size: 1,
                ptr: None,
            },
            TaintOp::LoadMem {
                dst: Some(make_laddr(1, 0)),
                size: 1,
                ptr: None,
            },
        ];
        execute(&ops, &mut shadow, &mut memlog, false).unwrap();
        assert_eq!(shadow.query(make_laddr(0, 0)), LabelSet::singleton(2));
        assert_eq!(shadow.query(make_laddr(1, 0)), LabelSet::singleton(1));
        assert!(memlog.is_empty());
    }

    #[test]
    fn test_store_mixes_tainted_pointer() {
        let mut shadow = shadow();
        shadow.label(make_greg(2, 0), 9).unwrap();
        shadow.label(make_laddr(0, 1), 4).unwrap();
        let mut memlog = TaintMemlog::new();
        memlog.push(0x100);

        let op = TaintOp::StoreMem {
            src: Some(make_laddr(0, 0)),
            size: 2,
            ptr: Some(Operand::new(make_greg(2, 0), 8)),
        };
        execute_op(&op, &mut shadow, &mut memlog).unwrap();
        assert_eq!(shadow.query(make_maddr(0x100)), LabelSet::singleton(9));
        assert_eq!(
            shadow.query(make_maddr(0x101)),
            [4, 9].into_iter().collect::<LabelSet>()
        );
    }

    #[test]
    fn test_mix_and_delete() {
        let mut shadow = shadow();
        shadow.label(make_laddr(0, 0), 1).unwrap();
        shadow.label(make_laddr(1, 3), 2).unwrap();
        let mut memlog = TaintMemlog::new();
        let ops = [
            TaintOp::Mix {
                dst: make_laddr(2, 0),
                srcs: vec![
                    Operand::new(make_laddr(0, 0), 4),
                    Operand::new(make_laddr(1, 0), 4),
                ],
                size: 4,
            },
            TaintOp::Delete {
                dst: make_laddr(0, 0),
                size: 4,
            },
        ];
        execute(&ops, &mut shadow, &mut memlog, true).unwrap();
        for labels in shadow.read(make_laddr(2, 0), 4) {
            assert_eq!(labels.to_vec(), vec![1, 2]);
        }
        assert!(shadow.query(make_laddr(0, 0)).is_empty());
    }

    #[test]
    fn test_memlog_underflow_is_an_error() {
        let mut shadow = shadow();
        let mut memlog = TaintMemlog::new();
        let op = TaintOp::LoadMem {
            dst: None,
            size: 4,
            ptr: None,
        };
        assert!(matches!(
            execute_op(&op, &mut shadow, &mut memlog),
            Err(Error::IllegalState(_))
        ));
    }
}
