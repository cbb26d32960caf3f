//! Party boundary: passive share stores addressed through opaque tensor
//! references, plus the opcode set a party can run over its arena.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayD;

use crate::error::{Error, Result};
use crate::ring::RingSpec;
use crate::tensor::{self, ContractKind};

/// Opaque party identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Handle to one tensor in one party's arena. Holding a reference conveys
/// no information about the stored value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorRef {
    party: PartyId,
    id: u64,
}

impl TensorRef {
    pub fn party(&self) -> &PartyId {
        &self.party
    }
}

/// One operation a party can run locally, addressed entirely through
/// arena references and public tensors.
#[derive(Clone, Debug)]
pub enum LocalOp {
    Add {
        lhs: TensorRef,
        rhs: TensorRef,
    },
    Sub {
        lhs: TensorRef,
        rhs: TensorRef,
    },
    Neg {
        x: TensorRef,
    },
    /// Copy with broadcast; doubles as the identity op for parties that only
    /// need a fresh reference.
    Broadcast {
        x: TensorRef,
        shape: Vec<usize>,
    },
    /// Absorb a public tensor into this party's fragment.
    AddPublic {
        x: TensorRef,
        public: ArrayD<u64>,
    },
    /// Share-times-public contraction. `flipped` puts the public operand on
    /// the left of the contraction.
    ContractPublic {
        kind: ContractKind,
        x: TensorRef,
        public: ArrayD<u64>,
        flipped: bool,
    },
    /// Beaver recombination: C + op(eps, B) + op(A, delta), plus the public
    /// op(eps, delta) term on the designated party.
    BeaverCombine {
        kind: ContractKind,
        a: TensorRef,
        b: TensorRef,
        c: TensorRef,
        eps: ArrayD<u64>,
        delta: ArrayD<u64>,
        designated: bool,
    },
    SumAxes {
        x: TensorRef,
        axes: Option<Vec<usize>>,
        keepdim: bool,
    },
    Concat {
        xs: Vec<TensorRef>,
        axis: usize,
    },
    Stack {
        xs: Vec<TensorRef>,
        axis: usize,
    },
    Gather {
        x: TensorRef,
        axis: usize,
        indices: Vec<usize>,
    },
    Reshape {
        x: TensorRef,
        shape: Vec<usize>,
    },
}

/// A party's external surface: a share store plus a local-opcode interpreter.
/// Parties never talk to each other; every round goes through the caller.
#[async_trait]
pub trait PartyNode: Send + Sync {
    fn id(&self) -> PartyId;

    /// Store a tensor, returning a fresh reference.
    async fn store(&self, tensor: ArrayD<u64>) -> Result<TensorRef>;

    /// Fetch a stored tensor. Panics on a foreign or deleted reference.
    async fn retrieve(&self, r: &TensorRef) -> Result<ArrayD<u64>>;

    /// Drop a stored tensor.
    async fn delete(&self, r: &TensorRef) -> Result<()>;

    /// Run one local operation, storing its result.
    async fn execute(&self, ring: RingSpec, op: LocalOp) -> Result<TensorRef>;
}

pub type PartyHandle = Arc<dyn PartyNode>;

/// In-process party backed by a mutex-guarded arena. The `offline` toggle
/// simulates an unreachable party for failure-path tests and demos.
pub struct LocalParty {
    id: PartyId,
    arena: Mutex<HashMap<u64, ArrayD<u64>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

impl LocalParty {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: PartyId::new(name),
            arena: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            offline: AtomicBool::new(false),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::PartyUnavailable(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn insert(&self, tensor: ArrayD<u64>) -> TensorRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_arena().insert(id, tensor);
        TensorRef {
            party: self.id.clone(),
            id,
        }
    }

    fn lock_arena(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ArrayD<u64>>> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fetch(arena: &HashMap<u64, ArrayD<u64>>, id: &PartyId, r: &TensorRef) -> ArrayD<u64> {
        assert_eq!(r.party(), id, "tensor reference belongs to another party");
        match arena.get(&r.id) {
            Some(t) => t.clone(),
            None => panic!("tensor reference {} was deleted", r.id),
        }
    }
}

#[async_trait]
impl PartyNode for LocalParty {
    fn id(&self) -> PartyId {
        self.id.clone()
    }

    async fn store(&self, tensor: ArrayD<u64>) -> Result<TensorRef> {
        self.check_online()?;
        Ok(self.insert(tensor))
    }

    async fn retrieve(&self, r: &TensorRef) -> Result<ArrayD<u64>> {
        self.check_online()?;
        let arena = self.lock_arena();
        Ok(Self::fetch(&arena, &self.id, r))
    }

    async fn delete(&self, r: &TensorRef) -> Result<()> {
        self.check_online()?;
        assert_eq!(r.party(), &self.id, "tensor reference belongs to another party");
        let removed = self.lock_arena().remove(&r.id);
        assert!(removed.is_some(), "tensor reference {} was deleted", r.id);
        Ok(())
    }

    async fn execute(&self, ring: RingSpec, op: LocalOp) -> Result<TensorRef> {
        self.check_online()?;
        let out = {
            let arena = self.lock_arena();
            let get = |r: &TensorRef| Self::fetch(&arena, &self.id, r);
            match op {
                LocalOp::Add { lhs, rhs } => tensor::add(&ring, &get(&lhs), &get(&rhs))?,
                LocalOp::Sub { lhs, rhs } => tensor::sub(&ring, &get(&lhs), &get(&rhs))?,
                LocalOp::Neg { x } => tensor::neg(&ring, &get(&x)),
                LocalOp::Broadcast { x, shape } => {
                    let src = get(&x);
                    match src.broadcast(ndarray::IxDyn(&shape)) {
                        Some(v) => v.to_owned(),
                        None => {
                            return Err(Error::ShapeMismatch {
                                lhs: src.shape().to_vec(),
                                rhs: shape,
                            })
                        }
                    }
                }
                LocalOp::AddPublic { x, public } => tensor::add(&ring, &get(&x), &public)?,
                LocalOp::ContractPublic {
                    kind,
                    x,
                    public,
                    flipped,
                } => {
                    let share = get(&x);
                    if flipped {
                        tensor::contract(&ring, &kind, &public, &share)?
                    } else {
                        tensor::contract(&ring, &kind, &share, &public)?
                    }
                }
                LocalOp::BeaverCombine {
                    kind,
                    a,
                    b,
                    c,
                    eps,
                    delta,
                    designated,
                } => {
                    let mut out = tensor::add(
                        &ring,
                        &get(&c),
                        &tensor::contract(&ring, &kind, &eps, &get(&b))?,
                    )?;
                    out = tensor::add(
                        &ring,
                        &out,
                        &tensor::contract(&ring, &kind, &get(&a), &delta)?,
                    )?;
                    if designated {
                        out = tensor::add(
                            &ring,
                            &out,
                            &tensor::contract(&ring, &kind, &eps, &delta)?,
                        )?;
                    }
                    out
                }
                LocalOp::SumAxes { x, axes, keepdim } => {
                    tensor::sum_axes(&ring, &get(&x), axes.as_deref(), keepdim)?
                }
                LocalOp::Concat { xs, axis } => {
                    let tensors: Vec<_> = xs.iter().map(&get).collect();
                    let views: Vec<_> = tensors.iter().collect();
                    tensor::concat(&views, axis)?
                }
                LocalOp::Stack { xs, axis } => {
                    let tensors: Vec<_> = xs.iter().map(&get).collect();
                    let views: Vec<_> = tensors.iter().collect();
                    tensor::stack_new_axis(&views, axis)?
                }
                LocalOp::Gather { x, axis, indices } => tensor::gather(&get(&x), axis, &indices)?,
                LocalOp::Reshape { x, shape } => tensor::reshape(&get(&x), &shape)?,
            }
        };
        Ok(self.insert(out))
    }
}
