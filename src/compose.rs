//! Pipeline composition (C5, §4.4): folding a host [`Source`] and an ordered
//! list of instances into a single [`Pipe`].
//!
//! Transcribed from `Append`/`append` in the original engine: the first
//! instance sits directly on the source, every instance after it sits on the
//! previous stage, and the intermediate type between stages is
//! `serde_json::Value` — stages in the middle of a pipeline never know or
//! care what the edge types `S`/`R` are.

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::pipe::{FromPipe, FromSource, IdentityPipe};
use crate::runtime::Instance;
use crate::source::{Pipe, Source};

/// The zero-stage composition (§9 Open Question 4): nothing to instantiate,
/// so the source itself — reinterpreted as a `Pipe<T>` — is the whole
/// pipeline. Unlike the `n >= 1` case handled by [`load`], there is no type
/// conversion here: a config with no lens stages hands back values of
/// exactly the type it was given.
pub fn identity<T: Serialize + 'static>(source: Box<dyn Source<T>>) -> Box<dyn Pipe<T>> {
    Box::new(IdentityPipe::new(source))
}

/// Composes `source` through one or more `instances` in order, returning the
/// resulting pipeline as a single [`Pipe<R>`].
///
/// One instance yields a single [`FromSource`]; more instances fold the
/// middle ones through `serde_json::Value` before landing on `R` at the
/// last. Panics if `instances` is empty — callers with zero stages must use
/// [`identity`] instead, since only it can preserve `S == R` without forcing
/// every caller of `load` to prove that equality to the type system.
pub fn load<S, R>(source: Box<dyn Source<S>>, mut instances: Vec<Rc<dyn Instance>>) -> Box<dyn Pipe<R>>
where
    S: Serialize + 'static,
    R: DeserializeOwned + 'static,
{
    assert!(
        !instances.is_empty(),
        "compose::load requires at least one instance; use compose::identity for zero stages"
    );

    if instances.len() == 1 {
        let only = instances.remove(0);
        return Box::new(FromSource::<S, R>::new(source, only));
    }

    let last = instances.pop().expect("checked len >= 2 above");
    let mut stages = instances.into_iter();
    let first = stages.next().expect("checked len >= 2 above");

    let mut stage: Box<dyn Pipe<Value>> = Box::new(FromSource::<S, Value>::new(source, first));
    for middle in stages {
        stage = Box::new(FromPipe::<Value, Value>::new(stage, middle));
    }
    Box::new(FromPipe::<Value, R>::new(stage, last))
}
