//! A Tensor with autograd capabilities.
//!
//! Every graph-aware operation records its parents and a backward closure, so a
//! scalar loss built from these operations can be differentiated with
//! [`Tensor::backward`]. Gradients of leaf tensors (predictions, parameters) are
//! kept after the pass; intermediate nodes are released.

use crate::error::{LossError, Result};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use rand::distributions::{Distribution, Uniform};
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

type BackwardOp = Rc<dyn Fn(&Tensor)>;

/// Holds the actual tensor data, its gradient, and graph information.
#[derive(Default)]
pub struct TensorData {
    pub data: ArrayD<f32>,
    pub grad: Option<Tensor>,
    _backward: Option<BackwardOp>,
    _prev: Vec<Tensor>,
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("data", &self.data)
            .field("grad", &self.grad)
            .field(
                "_backward",
                &self._backward.as_ref().map(|_| "BackwardOp"),
            )
            .field("_prev", &self._prev.len())
            .finish()
    }
}

/// The public Tensor struct, a shared pointer to the underlying data.
/// Cloning a Tensor only copies the Rc pointer; use [`Tensor::detach`] for a
/// copy of the values that is cut from the graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub inner: Rc<RefCell<TensorData>>,
}

// Pointer identity, used by the topological sort.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Tensor {}
impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.inner.as_ptr()).hash(state);
    }
}

impl Tensor {
    /// Creates a leaf tensor from raw row-major data and a shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let len = data.len();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| {
            LossError::shape_mismatch(
                "Tensor::new",
                format!("{} elements", shape.iter().product::<usize>()),
                format!("{} elements for shape {:?}", len, shape),
            )
        })?;
        Ok(Self::from_data(data))
    }

    /// Creates a leaf tensor from an existing ndarray::ArrayD.
    pub fn from_data(data: ArrayD<f32>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TensorData {
                data,
                ..Default::default()
            })),
        }
    }

    /// Creates a new tensor of zeros with the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::from_data(ArrayD::zeros(IxDyn(&shape)))
    }

    /// Creates a new tensor of ones with the same shape as the provided tensor.
    pub fn ones_like(tensor: &Tensor) -> Self {
        Self::from_data(ArrayD::ones(IxDyn(&tensor.shape())))
    }

    /// Creates a tensor filled with values drawn uniformly from `[low, high)`.
    pub fn uniform(shape: Vec<usize>, low: f32, high: f32) -> Self {
        let mut rng = rand::thread_rng();
        let dist = Uniform::new(low, high);
        Self::from_data(ArrayD::from_shape_simple_fn(IxDyn(&shape), || {
            dist.sample(&mut rng)
        }))
    }

    // --- Accessors ---
    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().data.shape().to_vec()
    }
    pub fn ndim(&self) -> usize {
        self.inner.borrow().data.ndim()
    }
    pub fn data(&self) -> Ref<'_, ArrayD<f32>> {
        Ref::map(self.inner.borrow(), |d| &d.data)
    }
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.borrow().grad.clone()
    }
    pub fn set_grad(&self, grad: Tensor) {
        self.inner.borrow_mut().grad = Some(grad);
    }

    /// Returns the value of a single-element tensor (0.0 for an empty one).
    pub fn item(&self) -> f32 {
        self.data().iter().next().copied().unwrap_or(0.0)
    }

    fn add_grad(&self, grad: Tensor) {
        let mut inner = self.inner.borrow_mut();
        if let Some(existing_grad) = inner.grad.take() {
            let summed = &*existing_grad.data() + &*grad.data();
            inner.grad = Some(Tensor::from_data(summed));
        } else {
            inner.grad = Some(grad);
        }
    }

    /// Wires `self` into the graph as the output of `parents`.
    fn attach(&self, parents: Vec<Tensor>, backward: BackwardOp) {
        let mut inner = self.inner.borrow_mut();
        inner._prev = parents;
        inner._backward = Some(backward);
    }

    // --- Autograd ---

    /// Kicks off backpropagation from this tensor.
    pub fn backward(&self) {
        let mut topo: Vec<Tensor> = Vec::new();
        let mut visited: HashSet<Tensor> = HashSet::new();
        fn build_topo(node: &Tensor, visited: &mut HashSet<Tensor>, topo: &mut Vec<Tensor>) {
            if visited.insert(node.clone()) {
                let children = node.inner.borrow()._prev.clone();
                for child in &children {
                    build_topo(child, visited, topo);
                }
                topo.push(node.clone());
            }
        }
        build_topo(self, &mut visited, &mut topo);

        self.set_grad(Tensor::ones_like(self));

        // Walk backwards, then drop the graph of every intermediate node so the
        // Rc links between nodes are released.
        for node in topo.iter().rev() {
            let backward_fn = node.inner.borrow()._backward.clone();
            let Some(backward_fn) = backward_fn else {
                continue;
            };
            if let Some(grad) = node.grad() {
                backward_fn(&grad);
            }
            let mut inner = node.inner.borrow_mut();
            inner._prev.clear();
            inner._backward = None;
            inner.grad = None;
        }
    }

    /// Returns a leaf copy of the values with no link to the graph. Gradients
    /// never flow through the result.
    pub fn detach(&self) -> Tensor {
        Tensor::from_data(self.data().to_owned())
    }

    // --- Graph-aware Operations ---

    /// Applies the square root element-wise.
    pub fn sqrt(&self) -> Tensor {
        let out = Tensor::from_data(self.data().mapv(f32::sqrt));

        let self_clone = self.clone();
        let out_weak = Rc::downgrade(&out.inner);
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                if let Some(out_rc) = out_weak.upgrade() {
                    // d(sqrt(x))/dx = 1 / (2 * sqrt(x)), with sqrt(x) floored at
                    // f32::EPSILON so x = 0 gives a large but finite gradient
                    let out_tensor = Tensor { inner: out_rc };
                    let denom = out_tensor.data().mapv(|v| 2.0 * v.max(f32::EPSILON));
                    let grad_data = &*grad.data() / &denom;
                    self_clone.add_grad(Tensor::from_data(grad_data));
                }
            }),
        );
        out
    }

    /// Squares every element.
    pub fn square(&self) -> Tensor {
        let out = Tensor::from_data(self.data().mapv(|x| x * x));

        let self_clone = self.clone();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let grad_data = { &*grad.data() * &(2.0 * &*self_clone.data()) };
                self_clone.add_grad(Tensor::from_data(grad_data));
            }),
        );
        out
    }

    /// Sums all elements, returning a tensor of shape `[1]`.
    pub fn sum(&self) -> Tensor {
        let out = Tensor::from_data(ArrayD::from_elem(IxDyn(&[1]), self.data().sum()));

        let self_clone = self.clone();
        let self_shape = self.shape();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let grad_to_add = ArrayD::from_elem(IxDyn(&self_shape), grad.item());
                self_clone.add_grad(Tensor::from_data(grad_to_add));
            }),
        );
        out
    }

    /// Reshapes the tensor, copying if the layout is not contiguous.
    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Tensor> {
        let original_shape = self.shape();
        let reshaped_data = self
            .data()
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&new_shape))
            .map_err(|_| {
                LossError::shape_mismatch(
                    "Tensor::reshape",
                    format!("{:?}", new_shape),
                    format!("{:?}", original_shape),
                )
            })?;
        let out = Tensor::from_data(reshaped_data);

        let self_clone = self.clone();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let grad_reshaped = grad
                    .data()
                    .as_standard_layout()
                    .into_owned()
                    .into_shape(IxDyn(&original_shape))
                    .unwrap_or_else(|e| panic!("reshape backward: {}", e));
                self_clone.add_grad(Tensor::from_data(grad_reshaped));
            }),
        );
        Ok(out)
    }

    /// Takes `len` consecutive entries starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let self_shape = self.shape();
        if axis >= self_shape.len() || start + len > self_shape[axis] {
            return Err(LossError::shape_mismatch(
                "Tensor::narrow",
                format!("range {}..{} on axis {}", start, start + len, axis),
                format!("{:?}", self_shape),
            ));
        }
        let range = Slice::from(start..start + len);
        let out_data = self.data().slice_axis(Axis(axis), range).to_owned();
        let out = Tensor::from_data(out_data);

        let self_clone = self.clone();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let mut grad_to_add = ArrayD::zeros(IxDyn(&self_shape));
                grad_to_add
                    .slice_axis_mut(Axis(axis), range)
                    .assign(&*grad.data());
                self_clone.add_grad(Tensor::from_data(grad_to_add));
            }),
        );
        Ok(out)
    }

    /// Gathers rows (entries along axis 0) in the order given by `indices`.
    /// The backward pass scatter-adds the incoming gradient into those rows.
    pub fn index_select(&self, indices: &[usize]) -> Result<Tensor> {
        let self_shape = self.shape();
        let rows = self_shape.first().copied().unwrap_or(0);
        if let Some(&bad) = indices.iter().find(|&&i| i >= rows) {
            return Err(LossError::shape_mismatch(
                "Tensor::index_select",
                format!("row index < {}", rows),
                format!("row index {}", bad),
            ));
        }
        let out = Tensor::from_data(self.data().select(Axis(0), indices));

        let self_clone = self.clone();
        let indices = indices.to_vec();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let mut grad_to_add = ArrayD::zeros(IxDyn(&self_shape));
                {
                    let grad_data = grad.data();
                    for (i, &idx) in indices.iter().enumerate() {
                        let mut row = grad_to_add.index_axis_mut(Axis(0), idx);
                        row += &grad_data.index_axis(Axis(0), i);
                    }
                }
                self_clone.add_grad(Tensor::from_data(grad_to_add));
            }),
        );
        Ok(out)
    }

    /// Builds a tensor whose row `i` is row `i` of `candidates[choice[i]]`.
    ///
    /// All candidates must share one shape and `choice` must have one entry per
    /// row. Gradient for row `i` flows only into the chosen candidate.
    pub fn choose_rows(candidates: &[Tensor], choice: &[usize]) -> Result<Tensor> {
        let first = candidates.first().ok_or_else(|| {
            LossError::shape_mismatch("Tensor::choose_rows", "at least one candidate", "none")
        })?;
        let shape = first.shape();
        if let Some(other) = candidates.iter().find(|c| c.shape() != shape) {
            return Err(LossError::shape_mismatch(
                "Tensor::choose_rows",
                format!("{:?}", shape),
                format!("{:?}", other.shape()),
            ));
        }
        let rows = shape.first().copied().unwrap_or(0);
        if choice.len() != rows {
            return Err(LossError::shape_mismatch(
                "Tensor::choose_rows",
                format!("{} choices", rows),
                format!("{} choices", choice.len()),
            ));
        }
        if let Some(&bad) = choice.iter().find(|&&k| k >= candidates.len()) {
            return Err(LossError::shape_mismatch(
                "Tensor::choose_rows",
                format!("candidate index < {}", candidates.len()),
                format!("candidate index {}", bad),
            ));
        }

        let mut out_data = ArrayD::zeros(IxDyn(&shape));
        for (i, &k) in choice.iter().enumerate() {
            let source = candidates[k].data();
            out_data
                .index_axis_mut(Axis(0), i)
                .assign(&source.index_axis(Axis(0), i));
        }
        let out = Tensor::from_data(out_data);

        let parents = candidates.to_vec();
        let choice = choice.to_vec();
        out.attach(
            candidates.to_vec(),
            Rc::new(move |grad: &Tensor| {
                for (k, candidate) in parents.iter().enumerate() {
                    let mut grad_to_add = ArrayD::zeros(IxDyn(&shape));
                    {
                        let grad_data = grad.data();
                        for i in (0..choice.len()).filter(|&i| choice[i] == k) {
                            grad_to_add
                                .index_axis_mut(Axis(0), i)
                                .assign(&grad_data.index_axis(Axis(0), i));
                        }
                    }
                    candidate.add_grad(Tensor::from_data(grad_to_add));
                }
            }),
        );
        Ok(out)
    }
}

/// Sum of squared errors between two equally shaped tensors.
pub fn sse(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    if prediction.shape() != target.shape() {
        return Err(LossError::shape_mismatch(
            "sse",
            format!("{:?}", prediction.shape()),
            format!("{:?}", target.shape()),
        ));
    }
    Ok((prediction - target).square().sum())
}

// --- Operator Overloads ---

/// Sums a gradient back down to the shape of a broadcast operand.
fn sum_grad_to_shape(grad_data: ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    let grad_shape = grad_data.shape().to_vec();
    if grad_shape == target_shape {
        return grad_data;
    }

    let grad_ndim = grad_shape.len();
    let target_ndim = target_shape.len();

    // Prepended axes, then axes where the operand had extent 1.
    let mut axes_to_sum: Vec<usize> = (0..grad_ndim.saturating_sub(target_ndim)).collect();
    for (i, &dim) in target_shape.iter().enumerate() {
        let grad_axis = i + (grad_ndim - target_ndim);
        if dim == 1 && grad_shape[grad_axis] != 1 {
            axes_to_sum.push(grad_axis);
        }
    }

    let mut summed = grad_data;
    for &axis in axes_to_sum.iter().rev() {
        summed = summed.sum_axis(Axis(axis));
    }

    let summed_shape = summed.shape().to_vec();
    summed
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(target_shape))
        .unwrap_or_else(|e| {
            panic!(
                "Failed to reshape summed grad from {:?} to {:?}: {}",
                summed_shape, target_shape, e
            )
        })
}

// --- ADD ---
impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        let out = Tensor::from_data(&*self.data() + &*rhs.data());
        let self_clone = self.clone();
        let rhs_clone = rhs.clone();
        out.attach(
            vec![self.clone(), rhs.clone()],
            Rc::new(move |grad: &Tensor| {
                let for_self = sum_grad_to_shape(grad.data().clone(), &self_clone.shape());
                self_clone.add_grad(Tensor::from_data(for_self));
                let for_rhs = sum_grad_to_shape(grad.data().clone(), &rhs_clone.shape());
                rhs_clone.add_grad(Tensor::from_data(for_rhs));
            }),
        );
        out
    }
}
impl<'a> Add<&'a Tensor> for Tensor { type Output = Tensor; fn add(self, rhs: &'a Tensor) -> Tensor { &self + rhs } }

// --- SUB ---
impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        let out = Tensor::from_data(&*self.data() - &*rhs.data());
        let self_clone = self.clone();
        let rhs_clone = rhs.clone();
        out.attach(
            vec![self.clone(), rhs.clone()],
            Rc::new(move |grad: &Tensor| {
                let for_self = sum_grad_to_shape(grad.data().clone(), &self_clone.shape());
                self_clone.add_grad(Tensor::from_data(for_self));
                let negated = &*grad.data() * -1.0;
                let for_rhs = sum_grad_to_shape(negated, &rhs_clone.shape());
                rhs_clone.add_grad(Tensor::from_data(for_rhs));
            }),
        );
        out
    }
}

// --- MUL ---
impl Mul<f32> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: f32) -> Self::Output {
        let out = Tensor::from_data(&*self.data() * rhs);
        let self_clone = self.clone();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                self_clone.add_grad(Tensor::from_data(&*grad.data() * rhs));
            }),
        );
        out
    }
}

// --- DIV ---
impl Div<f32> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: f32) -> Self::Output {
        let out = Tensor::from_data(&*self.data() / rhs);
        let self_clone = self.clone();
        out.attach(
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                self_clone.add_grad(Tensor::from_data(&*grad.data() / rhs));
            }),
        );
        out
    }
}
impl Div<f32> for Tensor { type Output = Tensor; fn div(self, rhs: f32) -> Tensor { &self / rhs } }
