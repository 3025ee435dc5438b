use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::kernels;

#[cfg(not(feature = "dtype-f64"))]
pub type Precision = f32;
#[cfg(feature = "dtype-f64")]
pub type Precision = f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TensorOp {
    Leaf,
    Reshape,
    Linear,
    ReLU,
    Conv2d,
    MaxPool2d,
    BatchNorm2d,
    Dropout,
    CrossEntropy,
}

/// Receives the gradient of the node it is attached to and pushes it into the
/// node's inputs. It never holds a strong reference to its own node.
pub(crate) type BackwardFn = Box<dyn Fn(&[Precision])>;

pub struct TensorCore {
    data: Vec<Precision>,
    shape: Vec<usize>,
    requires_grad: bool,
    grad: Vec<Precision>,
    backward: Option<BackwardFn>,
    op: TensorOp,
    prev: Vec<Rc<RefCell<TensorCore>>>,
}

impl TensorCore {
    pub(crate) fn data(&self) -> &[Precision] {
        &self.data
    }

    pub(crate) fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

// Box<dyn Fn> has no Debug, so the closure is reported by presence only.
impl std::fmt::Debug for TensorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorCore")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("op", &self.op)
            .field("numel", &self.data.len())
            .field("has_backward", &self.backward.is_some())
            .field("prev_count", &self.prev.len())
            .finish()
    }
}

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Restores the previous recording state when dropped.
struct GradModeGuard {
    previous: bool,
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|flag| flag.set(self.previous));
    }
}

/// Runs `f` without recording the autodiff tape. Tensors produced inside are
/// plain leaves, so evaluation passes neither build a graph nor keep one alive.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    let previous = GRAD_ENABLED.with(|flag| flag.replace(false));
    let _guard = GradModeGuard { previous };
    f()
}

pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|flag| flag.get())
}

/// Reference-counted handle to a node of the autodiff tape. Cloning is cheap
/// and shares the node; equality and hashing go by node identity.
#[derive(Debug)]
pub struct Tensor(pub(crate) Rc<RefCell<TensorCore>>);

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Tensor(self.0.clone())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Adds `delta` into the gradient buffer of `node` when it takes part in
/// differentiation.
pub(crate) fn accumulate(node: &Rc<RefCell<TensorCore>>, delta: &[Precision]) {
    let mut core = node.borrow_mut();
    if !core.requires_grad {
        return;
    }
    for (g, d) in core.grad.iter_mut().zip(delta) {
        *g += *d;
    }
}

impl Tensor {
    fn leaf(data: Vec<Precision>, shape: Vec<usize>, requires_grad: bool) -> Tensor {
        let grad = if requires_grad {
            vec![0.0; data.len()]
        } else {
            Vec::new()
        };
        Tensor(Rc::new(RefCell::new(TensorCore {
            data,
            shape,
            requires_grad,
            grad,
            backward: None,
            op: TensorOp::Leaf,
            prev: Vec::new(),
        })))
    }

    /// Builds the output node of an operation. The node is only wired into the
    /// tape when recording is enabled and at least one parent needs a gradient;
    /// `make_backward` is not called otherwise.
    pub(crate) fn from_op(
        data: Vec<Precision>,
        shape: Vec<usize>,
        parents: &[&Tensor],
        op: TensorOp,
        make_backward: impl FnOnce() -> BackwardFn,
    ) -> Tensor {
        let tracked = is_grad_enabled() && parents.iter().any(|p| p.requires_grad());
        if !tracked {
            return Tensor::leaf(data, shape, false);
        }
        let len = data.len();
        Tensor(Rc::new(RefCell::new(TensorCore {
            data,
            shape,
            requires_grad: true,
            grad: vec![0.0; len],
            backward: Some(make_backward()),
            op,
            prev: parents.iter().map(|p| p.0.clone()).collect(),
        })))
    }

    /// Wraps existing data; fails when `data` does not fill `shape`.
    pub fn new_data(data: Vec<Precision>, shape: Vec<usize>) -> Result<Tensor> {
        if data.len() != numel(&shape) {
            return Err(Error::ShapeMismatch {
                stage: "tensor".into(),
                expected: format!("{} elements", numel(&shape)),
                actual: vec![data.len()],
            });
        }
        Ok(Tensor::leaf(data, shape, false))
    }

    pub fn zeros(shape: Vec<usize>) -> Tensor {
        let data = vec![0.0; numel(&shape)];
        Tensor::leaf(data, shape, false)
    }

    pub fn ones(shape: Vec<usize>) -> Tensor {
        let data = vec![1.0; numel(&shape)];
        Tensor::leaf(data, shape, false)
    }

    pub fn full(shape: Vec<usize>, value: Precision) -> Tensor {
        let data = vec![value; numel(&shape)];
        Tensor::leaf(data, shape, false)
    }

    /// Zero-mean normal samples scaled by `sqrt(2 / fan_in)`, the He initialisation
    /// for layers followed by a rectifier. Marked as requiring a gradient.
    pub fn kaiming_he_init<R: Rng + ?Sized>(shape: Vec<usize>, fan_in: usize, rng: &mut R) -> Tensor {
        let std = (2.0 / fan_in.max(1) as Precision).sqrt();
        let data = (0..numel(&shape))
            .map(|_| rng.sample::<Precision, _>(StandardNormal) * std)
            .collect();
        Tensor::leaf(data, shape, true)
    }

    /// Turns a leaf into a trainable tensor (or back). Interior nodes keep the
    /// flag they were created with.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        let mut core = self.0.borrow_mut();
        if core.op != TensorOp::Leaf {
            return;
        }
        core.requires_grad = requires_grad;
        let len = if requires_grad { core.data.len() } else { 0 };
        core.grad = vec![0.0; len];
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Stable identity of the underlying node for the lifetime of the tensor.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn to_vec(&self) -> Vec<Precision> {
        self.0.borrow().data.clone()
    }

    /// Gradient accumulated by the last backward pass; empty when the tensor
    /// does not require a gradient.
    pub fn grad(&self) -> Vec<Precision> {
        self.0.borrow().grad.clone()
    }

    /// Runs `f` over the raw data without copying it.
    pub fn with_data<T>(&self, f: impl FnOnce(&[Precision]) -> T) -> T {
        f(&self.0.borrow().data)
    }

    /// Value of a single-element tensor such as a loss.
    pub fn item(&self) -> Result<Precision> {
        let core = self.0.borrow();
        match core.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(Error::ShapeMismatch {
                stage: "item".into(),
                expected: "a single element".into(),
                actual: core.shape.clone(),
            }),
        }
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad.fill(0.0);
    }

    /// Adds `delta` into the gradient buffer.
    pub fn accumulate_grad(&self, delta: &[Precision]) -> Result<()> {
        if delta.len() != self.numel() {
            return Err(Error::ShapeMismatch {
                stage: "accumulate_grad".into(),
                expected: format!("{} elements", self.numel()),
                actual: vec![delta.len()],
            });
        }
        accumulate(&self.0, delta);
        Ok(())
    }

    pub fn grad_is_finite(&self) -> bool {
        self.0.borrow().grad.iter().all(|g| g.is_finite())
    }

    pub fn data_is_finite(&self) -> bool {
        self.0.borrow().data.iter().all(|v| v.is_finite())
    }

    /// In-place update of a trainable tensor: `f(data, grad)`.
    pub fn update_data(&self, f: impl FnOnce(&mut [Precision], &[Precision])) {
        let mut core = self.0.borrow_mut();
        let TensorCore { data, grad, .. } = &mut *core;
        f(data, grad);
    }

    /// Seeds this tensor's gradient with ones and propagates it through the
    /// tape in reverse topological order. Called on a scalar loss.
    pub fn backward(&self) {
        {
            let mut core = self.0.borrow_mut();
            if !core.requires_grad {
                return;
            }
            core.grad.fill(1.0);
        }
        let topological_order = self.build_topological_graph();

        for tensor in topological_order.iter().rev() {
            let core = tensor.0.borrow();
            if let Some(ref backward_fn) = core.backward {
                backward_fn(&core.grad);
            }
        }
    }

    pub fn build_topological_graph(&self) -> Vec<Tensor> {
        let mut topologically_sorted: Vec<Tensor> = Vec::new();
        let mut visited: HashSet<Tensor> = HashSet::new();
        self.topo_recursive(&mut topologically_sorted, &mut visited);
        topologically_sorted
    }

    fn topo_recursive(&self, topologically_sorted: &mut Vec<Tensor>, visited: &mut HashSet<Tensor>) {
        if visited.insert(self.clone()) {
            for child in self.0.borrow().prev.iter() {
                Tensor(child.clone()).topo_recursive(topologically_sorted, visited);
            }
            topologically_sorted.push(self.clone());
        }
    }

    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Tensor> {
        let (data, old_shape) = {
            let core = self.0.borrow();
            (core.data.clone(), core.shape.clone())
        };
        if numel(&old_shape) != numel(&new_shape) {
            return Err(Error::ShapeMismatch {
                stage: "reshape".into(),
                expected: format!("{} elements for {:?}", numel(&new_shape), new_shape),
                actual: old_shape,
            });
        }

        let input = self.0.clone();
        Ok(Tensor::from_op(data, new_shape, &[self], TensorOp::Reshape, move || {
            Box::new(move |grad: &[Precision]| accumulate(&input, grad))
        }))
    }

    pub fn relu(&self) -> Tensor {
        let (result_data, shape) = {
            let core = self.0.borrow();
            let data = core.data.iter().map(|x| if x.is_nan() { *x } else { x.max(0.0) }).collect::<Vec<_>>();
            (data, core.shape.clone())
        };

        let input = self.0.clone();
        Tensor::from_op(result_data, shape, &[self], TensorOp::ReLU, move || {
            Box::new(move |grad: &[Precision]| {
                let delta: Vec<Precision> = {
                    let core = input.borrow();
                    core.data
                        .iter()
                        .zip(grad)
                        .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
                        .collect()
                };
                accumulate(&input, &delta);
            })
        })
    }

    /// `input (N, in) · weights (in, out) + bias (out)`.
    pub fn linear(&self, weights: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let input_shape = self.shape();
        let weight_shape = weights.shape();
        if input_shape.len() != 2 || weight_shape.len() != 2 || input_shape[1] != weight_shape[0] {
            return Err(Error::ShapeMismatch {
                stage: "linear".into(),
                expected: format!("(N, {})", weight_shape.first().copied().unwrap_or(0)),
                actual: input_shape,
            });
        }
        let (batch, in_features, out_features) = (input_shape[0], weight_shape[0], weight_shape[1]);
        if let Some(bias) = bias {
            if bias.numel() != out_features {
                return Err(Error::ShapeMismatch {
                    stage: "linear bias".into(),
                    expected: format!("({out_features})"),
                    actual: bias.shape(),
                });
            }
        }

        let mut result_data = {
            let x = self.0.borrow();
            let w = weights.0.borrow();
            kernels::gemm(&x.data, &w.data, batch, in_features, out_features)
        };
        if let Some(bias) = bias {
            let b = bias.0.borrow();
            for row in result_data.chunks_mut(out_features.max(1)) {
                for (y, b) in row.iter_mut().zip(&b.data) {
                    *y += *b;
                }
            }
        }

        let mut parents = vec![self, weights];
        parents.extend(bias);
        let input = self.0.clone();
        let weight = weights.0.clone();
        let bias = bias.map(|b| b.0.clone());
        Ok(Tensor::from_op(
            result_data,
            vec![batch, out_features],
            &parents,
            TensorOp::Linear,
            move || {
                Box::new(move |grad: &[Precision]| {
                    let (grad_input, grad_weight) = {
                        let x = input.borrow();
                        let w = weight.borrow();
                        let grad_input = x.requires_grad.then(|| {
                            kernels::gemm_a_bt(grad, &w.data, batch, out_features, in_features)
                        });
                        let grad_weight = w.requires_grad.then(|| {
                            kernels::gemm_at_b(&x.data, grad, batch, in_features, out_features)
                        });
                        (grad_input, grad_weight)
                    };
                    if let Some(delta) = grad_input {
                        accumulate(&input, &delta);
                    }
                    if let Some(delta) = grad_weight {
                        accumulate(&weight, &delta);
                    }
                    if let Some(ref bias) = bias {
                        let mut delta = vec![0.0; out_features];
                        for row in grad.chunks(out_features.max(1)) {
                            for (d, g) in delta.iter_mut().zip(row) {
                                *d += *g;
                            }
                        }
                        accumulate(bias, &delta);
                    }
                })
            },
        ))
    }
}
