//! Container walking through lifted accessors
//!
//! The walk is the begin / compare-with-end / dereference / advance loop,
//! entirely over lifted programs, bounded by the iteration cap so a cyclic or
//! corrupted container terminates with a divergence outcome rather than
//! hanging.

use crate::classify::IterableShape;
use crate::config::AnalysisConfig;
use coregraph_image::MemoryImage;
use coregraph_lifter::{EvalError, Evaluator};
use tracing::debug;

/// Result of walking one container.
#[derive(Debug, Default)]
pub struct ContainerWalk {
    /// Addresses of the elements located by dereferencing each iterator
    pub elements: Vec<u64>,
    /// The iteration cap was hit before `end` was reached
    pub diverged: bool,
    /// An accessor evaluation failed mid-walk; `elements` holds the prefix
    pub failure: Option<EvalError>,
}

/// Walk an iterable object at `container_addr`.
pub fn walk_container(
    image: &MemoryImage,
    shape: &IterableShape,
    container_addr: u64,
    config: &AnalysisConfig,
) -> ContainerWalk {
    let ev = Evaluator::new(image, config.accessor_step_budget);
    let mut walk = ContainerWalk::default();

    let mut it = match ev.evaluate(&shape.begin, &[container_addr]) {
        Ok(v) => v,
        Err(e) => {
            walk.failure = Some(e);
            return walk;
        }
    };
    let end = match ev.evaluate(&shape.end, &[container_addr]) {
        Ok(v) => v,
        Err(e) => {
            walk.failure = Some(e);
            return walk;
        }
    };

    for _ in 0..config.max_container_iterations {
        let raw = match ev.evaluate(&shape.equality, &[it, end]) {
            Ok(v) => v,
            Err(e) => {
                walk.failure = Some(e);
                return walk;
            }
        };
        let at_end = if shape.equality_is_negated {
            raw == 0
        } else {
            raw != 0
        };
        if at_end {
            return walk;
        }

        match ev.evaluate(&shape.deref, &[it]) {
            Ok(element) => walk.elements.push(element),
            Err(e) => {
                walk.failure = Some(e);
                return walk;
            }
        }
        it = match ev.evaluate(&shape.increment, &[it]) {
            Ok(v) => v,
            Err(e) => {
                walk.failure = Some(e);
                return walk;
            }
        };
    }

    debug!(
        "container at {container_addr:#x} exceeded {} iterations",
        config.max_container_iterations
    );
    walk.diverged = true;
    walk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::IterableShape;
    use coregraph_image::{MemoryRegion, Permissions};
    use coregraph_lifter::{AccessorOp, AccessorProgram, Cond, MemRef, RValue, Reg};
    use std::sync::Arc;

    fn prog(name: &str, ops: Vec<AccessorOp>) -> Arc<AccessorProgram> {
        Arc::new(AccessorProgram {
            linkage_name: name.to_string(),
            function_address: 0,
            ops,
        })
    }

    /// Shape of a `{ T* first; T* last; }` container with 8-byte elements.
    fn vec_shape() -> IterableShape {
        IterableShape {
            begin: prog(
                "begin",
                vec![
                    AccessorOp::Move {
                        dst: Reg::RAX,
                        src: RValue::Mem {
                            mem: MemRef::base_disp(Reg::RDI, 0),
                            size: 8,
                            sign_extend: false,
                        },
                        width: 8,
                    },
                    AccessorOp::Return,
                ],
            ),
            end: prog(
                "end",
                vec![
                    AccessorOp::Move {
                        dst: Reg::RAX,
                        src: RValue::Mem {
                            mem: MemRef::base_disp(Reg::RDI, 8),
                            size: 8,
                            sign_extend: false,
                        },
                        width: 8,
                    },
                    AccessorOp::Return,
                ],
            ),
            deref: prog(
                "deref",
                vec![
                    AccessorOp::Move {
                        dst: Reg::RAX,
                        src: RValue::Reg {
                            reg: Reg::RDI,
                            width: 8,
                        },
                        width: 8,
                    },
                    AccessorOp::Return,
                ],
            ),
            increment: prog(
                "inc",
                vec![
                    AccessorOp::Lea {
                        dst: Reg::RAX,
                        mem: MemRef::base_disp(Reg::RDI, 8),
                    },
                    AccessorOp::Return,
                ],
            ),
            equality: prog(
                "eq",
                vec![
                    AccessorOp::Compare {
                        a: RValue::Reg {
                            reg: Reg::RDI,
                            width: 8,
                        },
                        b: RValue::Reg {
                            reg: Reg::RSI,
                            width: 8,
                        },
                    },
                    AccessorOp::SetCond {
                        dst: Reg::RAX,
                        cond: Cond::Eq,
                    },
                    AccessorOp::Return,
                ],
            ),
            equality_is_negated: false,
            iterator_type: "long*".to_string(),
            element_type: "long".to_string(),
            element_size: 8,
        }
    }

    #[test]
    fn walk_collects_every_element() {
        // Container header at 0x1000: first = 0x2000, last = 0x2018 (3 elems).
        let mut header = Vec::new();
        header.extend_from_slice(&0x2000u64.to_le_bytes());
        header.extend_from_slice(&0x2018u64.to_le_bytes());
        let image = MemoryImage::from_regions(vec![
            MemoryRegion::new(0x1000, Permissions::RW, header),
            MemoryRegion::new(0x2000, Permissions::RW, vec![0; 0x18]),
        ])
        .unwrap();

        let walk = walk_container(&image, &vec_shape(), 0x1000, &AnalysisConfig::default());
        assert!(!walk.diverged);
        assert!(walk.failure.is_none());
        assert_eq!(walk.elements, vec![0x2000, 0x2008, 0x2010]);
    }

    #[test]
    fn corrupted_container_diverges_instead_of_hanging() {
        // last < first: the iterator never reaches end.
        let mut header = Vec::new();
        header.extend_from_slice(&0x2000u64.to_le_bytes());
        header.extend_from_slice(&0x1ff8u64.to_le_bytes());
        let image = MemoryImage::from_regions(vec![
            MemoryRegion::new(0x1000, Permissions::RW, header),
            MemoryRegion::new(0x2000, Permissions::RW, vec![0; 0x18]),
        ])
        .unwrap();

        let config = AnalysisConfig::default().max_container_iterations(64);
        let walk = walk_container(&image, &vec_shape(), 0x1000, &config);
        assert!(walk.diverged);
        assert_eq!(walk.elements.len(), 64);
    }

    #[test]
    fn unmapped_container_header_is_a_failure_not_a_panic() {
        let image = MemoryImage::from_regions(vec![MemoryRegion::new(
            0x9000,
            Permissions::RW,
            vec![0; 8],
        )])
        .unwrap();
        let walk = walk_container(&image, &vec_shape(), 0x1000, &AnalysisConfig::default());
        assert!(matches!(
            walk.failure,
            Some(EvalError::InvalidMemoryReference { .. })
        ));
    }
}
