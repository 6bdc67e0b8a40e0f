//! Pipe stages (C4, §4.3): the glue between a [`Source`]/[`Pipe`] and one
//! WASM [`Instance`].
//!
//! Each stage wraps exactly one upstream and one instance. Pulling a value
//! from a stage drives the guest's `transform` export, which in turn pulls
//! from upstream through the `lens.next` import exactly as many times as it
//! needs (possibly zero, possibly many — fan-in is the guest's choice, not
//! this file's). `FromSource` sits directly on a host [`Source`] and
//! JSON-encodes each pulled value; `FromPipe` sits on another stage and
//! forwards its upstream's already wire-encoded bytes unchanged, so no stage
//! but the first ever re-serializes a value it didn't produce itself.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{LensError, Result};
use crate::runtime::Instance;
use crate::source::{Pipe, Source};
use crate::wire::Frame;

/// Invokes `transform`, reads and frees its output frame, and classifies the
/// result: `Ok(None)` for end of stream, `Ok(Some(frame))` for a value frame,
/// `Err` if the guest returned an error frame or the call itself failed.
///
/// Shared by [`FromSource`] and [`FromPipe`], which differ only in how they
/// build the `pull` closure passed to `Instance::transform`.
fn drive(
    instance: &Rc<dyn Instance>,
    pull: crate::runtime::HostNext,
) -> Result<Option<Frame>> {
    let address = instance.transform(pull)?;
    let (frame, len) = instance.read_frame(address)?;
    instance.free(address, len)?;
    match frame {
        Frame::EndOfStream => Ok(None),
        Frame::Error(message) => Err(LensError::Transform(message)),
        other => Ok(Some(other)),
    }
}

fn decode<R: DeserializeOwned>(frame: &Frame) -> Result<R> {
    match frame {
        Frame::Nil => Ok(serde_json::from_value(serde_json::Value::Null)?),
        Frame::Json(bytes) => Ok(serde_json::from_slice(bytes)?),
        Frame::Error(message) => Err(LensError::Transform(message.clone())),
        Frame::EndOfStream => unreachable!("end of stream is never stored as a current frame"),
    }
}

/// A stage whose upstream is a host [`Source`]: each pulled value is
/// JSON-encoded before being written into the guest's memory.
pub struct FromSource<S: 'static, R> {
    upstream: Rc<RefCell<Box<dyn Source<S>>>>,
    instance: Rc<dyn Instance>,
    current: RefCell<Option<Frame>>,
    _marker: PhantomData<R>,
}

impl<S: 'static, R> FromSource<S, R> {
    pub fn new(upstream: Box<dyn Source<S>>, instance: Rc<dyn Instance>) -> Self {
        FromSource {
            upstream: Rc::new(RefCell::new(upstream)),
            instance,
            current: RefCell::new(None),
            _marker: PhantomData,
        }
    }
}

impl<S, R> Source<R> for FromSource<S, R>
where
    S: Serialize + 'static,
    R: DeserializeOwned,
{
    fn next(&mut self) -> Result<bool> {
        let upstream = self.upstream.clone();
        let pull: crate::runtime::HostNext = Box::new(move || {
            let mut source = upstream.borrow_mut();
            if source.next().map_err(|e| LensError::Pull(e.to_string()))? {
                let value = source.value().map_err(|e| LensError::Pull(e.to_string()))?;
                let payload = serde_json::to_vec(&value)?;
                Ok(Frame::Json(payload).encode())
            } else {
                Ok(Frame::EndOfStream.encode())
            }
        });

        match drive(&self.instance, pull)? {
            None => {
                *self.current.borrow_mut() = None;
                Ok(false)
            }
            Some(frame) => {
                *self.current.borrow_mut() = Some(frame);
                Ok(true)
            }
        }
    }

    fn value(&mut self) -> Result<R> {
        let frame = self
            .current
            .borrow()
            .clone()
            .expect("Source::value called before a successful Source::next");
        decode(&frame)
    }

    fn reset(&mut self) {
        *self.current.borrow_mut() = None;
        self.upstream.borrow_mut().reset();
    }
}

impl<S, R> Pipe<R> for FromSource<S, R>
where
    S: Serialize + 'static,
    R: DeserializeOwned,
{
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let frame = self
            .current
            .borrow()
            .clone()
            .expect("Pipe::bytes called before a successful Source::next");
        Ok(frame.encode())
    }
}

/// A stage whose upstream is another [`Pipe`]: pulled frames are forwarded
/// to the guest exactly as the upstream produced them, with no re-encoding.
pub struct FromPipe<S: 'static, R> {
    upstream: Rc<RefCell<Box<dyn Pipe<S>>>>,
    instance: Rc<dyn Instance>,
    current: RefCell<Option<Frame>>,
    _marker: PhantomData<R>,
}

impl<S: 'static, R> FromPipe<S, R> {
    pub fn new(upstream: Box<dyn Pipe<S>>, instance: Rc<dyn Instance>) -> Self {
        FromPipe {
            upstream: Rc::new(RefCell::new(upstream)),
            instance,
            current: RefCell::new(None),
            _marker: PhantomData,
        }
    }
}

impl<S, R> Source<R> for FromPipe<S, R>
where
    S: 'static,
    R: DeserializeOwned,
{
    fn next(&mut self) -> Result<bool> {
        let upstream = self.upstream.clone();
        let pull: crate::runtime::HostNext = Box::new(move || {
            let mut source = upstream.borrow_mut();
            if source.next().map_err(|e| LensError::Pull(e.to_string()))? {
                source.bytes().map_err(|e| LensError::Pull(e.to_string()))
            } else {
                Ok(Frame::EndOfStream.encode())
            }
        });

        match drive(&self.instance, pull)? {
            None => {
                *self.current.borrow_mut() = None;
                Ok(false)
            }
            Some(frame) => {
                *self.current.borrow_mut() = Some(frame);
                Ok(true)
            }
        }
    }

    fn value(&mut self) -> Result<R> {
        let frame = self
            .current
            .borrow()
            .clone()
            .expect("Source::value called before a successful Source::next");
        decode(&frame)
    }

    fn reset(&mut self) {
        *self.current.borrow_mut() = None;
        self.upstream.borrow_mut().reset();
    }
}

impl<S, R> Pipe<R> for FromPipe<S, R>
where
    S: 'static,
    R: DeserializeOwned,
{
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let frame = self
            .current
            .borrow()
            .clone()
            .expect("Pipe::bytes called before a successful Source::next");
        Ok(frame.encode())
    }
}

/// The zero-stage composition (§4.3, §9 Open Question 4): no instance sits
/// between the source and the caller, so there is nothing to drive and no
/// wire encoding to perform until `bytes` is actually asked for. This is the
/// one place this crate's shape departs from the original Go implementation,
/// which relies on an unchecked type assertion (`src.(Enumerable[T])`) that
/// has no sound Rust equivalent — see DESIGN.md.
pub struct IdentityPipe<T: 'static> {
    inner: Rc<RefCell<Box<dyn Source<T>>>>,
}

impl<T: 'static> IdentityPipe<T> {
    pub fn new(inner: Box<dyn Source<T>>) -> Self {
        IdentityPipe {
            inner: Rc::new(RefCell::new(inner)),
        }
    }
}

impl<T: 'static> Source<T> for IdentityPipe<T> {
    fn next(&mut self) -> Result<bool> {
        self.inner.borrow_mut().next()
    }

    fn value(&mut self) -> Result<T> {
        self.inner.borrow_mut().value()
    }

    fn reset(&mut self) {
        self.inner.borrow_mut().reset()
    }
}

impl<T: Serialize + 'static> Pipe<T> for IdentityPipe<T> {
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let value = self.inner.borrow_mut().value()?;
        let payload = serde_json::to_vec(&value)?;
        Ok(Frame::Json(payload).encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;
    use std::cell::Cell;

    /// A fake `Instance` whose `transform` just pulls once via `lens.next`
    /// and hands the result straight back, for stage tests that don't need
    /// a real guest module.
    struct EchoInstance {
        calls: Cell<u32>,
        pending: Cell<Option<(Frame, u32)>>,
    }

    impl EchoInstance {
        fn new() -> Self {
            EchoInstance {
                calls: Cell::new(0),
                pending: Cell::new(None),
            }
        }
    }

    impl Instance for EchoInstance {
        fn alloc(&self, _size: u32) -> Result<u32> {
            unreachable!("EchoInstance never receives top-level alloc calls")
        }
        fn free(&self, _address: u32, _size: u32) -> Result<()> {
            Ok(())
        }
        fn write_raw(&self, _address: u32, _data: &[u8]) -> Result<()> {
            unreachable!("EchoInstance never receives top-level write calls")
        }
        fn read_frame(&self, address: u32) -> Result<(Frame, u32)> {
            debug_assert_eq!(address, 0);
            Ok(self.pending.take().expect("no pending frame"))
        }
        fn transform(&self, mut next: crate::runtime::HostNext) -> Result<u32> {
            self.calls.set(self.calls.get() + 1);
            let bytes = next()?;
            let (frame, len) = Frame::decode(&bytes, 0)?;
            self.pending.set(Some((frame, len)));
            Ok(0)
        }
        fn set_param(&self, _address: u32) -> Result<u32> {
            unreachable!()
        }
        fn has_set_param(&self) -> bool {
            false
        }
    }

    #[test]
    fn from_source_echoes_values_then_ends() {
        let src: Box<dyn Source<i32>> = Box::new(VecSource::new(vec![1, 2, 3]));
        let instance: Rc<dyn Instance> = Rc::new(EchoInstance::new());
        let mut pipe: FromSource<i32, i32> = FromSource::new(src, instance);

        assert!(pipe.next().unwrap());
        assert_eq!(pipe.value().unwrap(), 1);
        assert!(pipe.next().unwrap());
        assert_eq!(pipe.value().unwrap(), 2);
        assert!(pipe.next().unwrap());
        assert_eq!(pipe.value().unwrap(), 3);
        assert!(!pipe.next().unwrap());
    }

    #[test]
    fn identity_pipe_forwards_source_without_an_instance() {
        let src: Box<dyn Source<&'static str>> = Box::new(VecSource::new(vec!["a", "b"]));
        let mut pipe = IdentityPipe::new(src);
        assert!(pipe.next().unwrap());
        assert_eq!(pipe.value().unwrap(), "a");
        let bytes = pipe.bytes().unwrap();
        assert_eq!(bytes, Frame::Json(serde_json::to_vec("a").unwrap()).encode());
    }
}
