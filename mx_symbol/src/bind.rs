//! Array inference and executor binding for symbols.
//!
//! These helpers fill in whatever the caller did not provide: missing
//! arguments and auxiliary states are allocated at their inferred shapes and
//! filled with N(0, 1) by the engine, missing gradient stores are allocated,
//! and missing gradient requests fall back to [`OpReqType::default_for`].

use std::collections::HashMap;

use crate::context::{Context, OpReqType};
use crate::engine::Engine;
use crate::error::Result;
use crate::executor::Executor;
use crate::ndarray::NDArray;
use crate::shape::Shape;
use crate::symbol::{ensure_same_engine, Symbol};

/// Arrays assembled for binding, in argument order.
pub struct ExecutorArrays<E: Engine + ?Sized = dyn Engine> {
    pub arg_arrays: Vec<NDArray<E>>,
    pub grad_arrays: Vec<NDArray<E>>,
    pub grad_reqs: Vec<OpReqType>,
    pub aux_arrays: Vec<NDArray<E>>,
}

impl<E: Engine + ?Sized> Symbol<E> {
    /// Shapes of the given arrays for the arguments they name.
    fn known_shapes(
        &self,
        arg_names: &[String],
        given: &HashMap<String, NDArray<E>>,
    ) -> Result<HashMap<String, Shape>> {
        let mut shapes = HashMap::new();
        for name in arg_names {
            if let Some(array) = given.get(name) {
                ensure_same_engine(self.engine(), array.engine())?;
                shapes.insert(name.clone(), array.shape()?);
            }
        }
        Ok(shapes)
    }

    fn sampled_array(&self, shape: &Shape, context: Context) -> Result<NDArray<E>> {
        let array = NDArray::new(self.engine(), shape, context, false)?;
        array.sample_gaussian(0.0, 1.0)?;
        Ok(array)
    }

    /// Infer and construct every array needed to bind this symbol.
    ///
    /// `args_map`, `arg_grad_store` and `grad_req_type` may cover any subset
    /// of the arguments.
    pub fn infer_executor_arrays(
        &self,
        context: Context,
        args_map: &HashMap<String, NDArray<E>>,
        arg_grad_store: &HashMap<String, NDArray<E>>,
        grad_req_type: &HashMap<String, OpReqType>,
    ) -> Result<ExecutorArrays<E>> {
        let arg_names = self.list_arguments()?;
        let shapes = self.infer_shape(&self.known_shapes(&arg_names, args_map)?)?;

        let mut arrays = ExecutorArrays {
            arg_arrays: Vec::with_capacity(arg_names.len()),
            grad_arrays: Vec::with_capacity(arg_names.len()),
            grad_reqs: Vec::with_capacity(arg_names.len()),
            aux_arrays: Vec::with_capacity(shapes.aux_shapes.len()),
        };

        for (name, shape) in arg_names.iter().zip(&shapes.arg_shapes) {
            match args_map.get(name) {
                Some(array) => arrays.arg_arrays.push(array.clone()),
                None => arrays.arg_arrays.push(self.sampled_array(shape, context)?),
            }

            match arg_grad_store.get(name) {
                Some(array) => {
                    ensure_same_engine(self.engine(), array.engine())?;
                    arrays.grad_arrays.push(array.clone());
                }
                None => arrays
                    .grad_arrays
                    .push(NDArray::new(self.engine(), shape, context, false)?),
            }

            let req = grad_req_type
                .get(name)
                .copied()
                .unwrap_or_else(|| OpReqType::default_for(name));
            arrays.grad_reqs.push(req);
        }

        for shape in &shapes.aux_shapes {
            arrays.aux_arrays.push(self.sampled_array(shape, context)?);
        }

        Ok(arrays)
    }

    /// Infer and construct every argument array, keyed by name.
    pub fn infer_args_map(
        &self,
        context: Context,
        known_args: &HashMap<String, NDArray<E>>,
    ) -> Result<HashMap<String, NDArray<E>>> {
        let arg_names = self.list_arguments()?;
        let shapes = self.infer_shape(&self.known_shapes(&arg_names, known_args)?)?;

        let mut args_map = HashMap::with_capacity(arg_names.len());
        for (name, shape) in arg_names.into_iter().zip(&shapes.arg_shapes) {
            let array = match known_args.get(&name) {
                Some(array) => array.clone(),
                None => self.sampled_array(shape, context)?,
            };
            args_map.insert(name, array);
        }
        Ok(args_map)
    }

    /// Infer the missing arrays, then bind.
    pub fn simple_bind(
        &self,
        context: Context,
        args_map: &HashMap<String, NDArray<E>>,
        arg_grad_store: &HashMap<String, NDArray<E>>,
        grad_req_type: &HashMap<String, OpReqType>,
    ) -> Result<Executor<E>> {
        let arrays = self.infer_executor_arrays(context, args_map, arg_grad_store, grad_req_type)?;
        Executor::bind(
            self,
            context,
            arrays.arg_arrays,
            arrays.grad_arrays,
            arrays.grad_reqs,
            arrays.aux_arrays,
        )
    }

    /// Bind this symbol to exactly the given arrays.
    ///
    /// Counts are forwarded as given: the engine decides whether they match
    /// the graph, and its error is returned unchanged.
    pub fn bind(
        &self,
        context: Context,
        arg_arrays: &[NDArray<E>],
        grad_arrays: &[NDArray<E>],
        grad_reqs: &[OpReqType],
        aux_arrays: &[NDArray<E>],
    ) -> Result<Executor<E>> {
        for array in arg_arrays.iter().chain(grad_arrays).chain(aux_arrays) {
            ensure_same_engine(self.engine(), array.engine())?;
        }
        Executor::bind(
            self,
            context,
            arg_arrays.to_vec(),
            grad_arrays.to_vec(),
            grad_reqs.to_vec(),
            aux_arrays.to_vec(),
        )
    }
}

