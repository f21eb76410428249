//! # Messages
//!
//! A message is an immutable, type-tagged tuple of values behind a reference
//! count. Cloning a message shares storage; consuming one moves the values
//! out when the handle is unique and deep-copies through the registry
//! metadata otherwise. The type list of a message never changes after
//! construction and is interned, so signature checks are pointer compares.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::registry::{self, intern, meta_of, same_list, tags, ErasedValue, TypeListRef};

/// An immutable, type-tagged, reference-counted value tuple.
#[derive(Clone)]
pub struct Message {
    types: TypeListRef,
    payload: Arc<Vec<ErasedValue>>,
}

impl Message {
    /// The empty message. Used for request acknowledgments and priming.
    pub fn unit() -> Self {
        Self {
            types: intern(&[]),
            payload: Arc::new(Vec::new()),
        }
    }

    /// Builds a one-element message. Fails with `unknown_type` when `A` was
    /// never registered.
    pub fn of<A: Any + Send + Sync>(a: A) -> Result<Self> {
        (a,).into_message()
    }

    /// Builds a two-element message.
    pub fn of2<A, B>(a: A, b: B) -> Result<Self>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
    {
        (a, b).into_message()
    }

    /// Builds a three-element message.
    pub fn of3<A, B, C>(a: A, b: B, c: C) -> Result<Self>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        C: Any + Send + Sync,
    {
        (a, b, c).into_message()
    }

    /// Builds a four-element message.
    pub fn of4<A, B, C, D>(a: A, b: B, c: C, d: D) -> Result<Self>
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        C: Any + Send + Sync,
        D: Any + Send + Sync,
    {
        (a, b, c, d).into_message()
    }

    /// Wraps an [`Error`] as the payload of an error response.
    pub(crate) fn from_error(err: Error) -> Self {
        Self {
            types: intern(&[tags::ERROR]),
            payload: Arc::new(vec![Box::new(err) as ErasedValue]),
        }
    }

    pub(crate) fn from_parts(types: TypeListRef, values: Vec<ErasedValue>) -> Self {
        debug_assert_eq!(types.len(), values.len());
        Self {
            types,
            payload: Arc::new(values),
        }
    }

    pub fn types(&self) -> TypeListRef {
        self.types
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True when this handle is the only owner of the payload; handlers get
    /// consuming access without a copy in that case.
    pub fn unique(&self) -> bool {
        Arc::strong_count(&self.payload) == 1
    }

    /// Pointer compare against an interned signature.
    pub fn matches(&self, list: TypeListRef) -> bool {
        same_list(self.types, list)
    }

    /// True when the payload is a single [`Error`] value.
    pub fn is_error(&self) -> bool {
        same_list(self.types, intern(&[tags::ERROR]))
    }

    /// Extracts the error payload, if this is an error message.
    pub fn to_error(&self) -> Option<Error> {
        if !self.is_error() {
            return None;
        }
        self.get::<Error>(0).cloned()
    }

    /// Borrows element `index` as `T`.
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.payload.get(index)?.as_any().downcast_ref::<T>()
    }

    /// Mutably borrows element `index`; only possible while the handle is
    /// unique.
    pub fn get_mut<T: Any>(&mut self, index: usize) -> Option<&mut T> {
        let values = Arc::get_mut(&mut self.payload)?;
        values.get_mut(index)?.as_any_mut().downcast_mut::<T>()
    }

    /// Moves the values out, copying through registry metadata when the
    /// payload is shared.
    pub(crate) fn into_values(self) -> Result<Vec<ErasedValue>> {
        let types = self.types;
        match Arc::try_unwrap(self.payload) {
            Ok(values) => Ok(values),
            Err(shared) => {
                let mut out = Vec::with_capacity(shared.len());
                for (value, tag) in shared.iter().zip(types.tags()) {
                    let meta = meta_of(*tag)?;
                    out.push(meta.copy(value.as_ref()));
                }
                Ok(out)
            }
        }
    }

    /// Typed extraction; see [`MessageArgs`].
    pub fn take<A: MessageArgs>(self) -> Result<A> {
        A::from_message(self)
    }

    /// Human-readable rendering via the registry's stringify entries.
    pub fn stringify(&self) -> String {
        let mut out = String::from("(");
        for (i, (value, tag)) in self.payload.iter().zip(self.types.tags()).enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match meta_of(*tag) {
                Ok(meta) => out.push_str(&meta.stringify(value.as_ref())),
                Err(_) => out.push_str("<unregistered>"),
            }
        }
        out.push(')');
        out
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message{}", self.stringify())
    }
}

/// Tuples of registered values, convertible to and from [`Message`].
pub trait MessageArgs: Sized + Send + 'static {
    /// Interned signature of this tuple.
    fn type_list() -> Result<TypeListRef>;

    /// Packs the tuple into a message.
    fn into_message(self) -> Result<Message>;

    /// Unpacks a message; fails with `unexpected_message` when the signature
    /// differs.
    fn from_message(msg: Message) -> Result<Self>;
}

impl MessageArgs for () {
    fn type_list() -> Result<TypeListRef> {
        Ok(intern(&[]))
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message::unit())
    }

    fn from_message(msg: Message) -> Result<Self> {
        if !msg.is_empty() {
            return Err(signature_mismatch(&msg));
        }
        Ok(())
    }
}

fn signature_mismatch(msg: &Message) -> Error {
    Error::with_message(
        ErrorCode::UnexpectedMessage,
        format!("signature mismatch for {msg:?}"),
    )
}

fn next_value<T: Any>(it: &mut std::vec::IntoIter<ErasedValue>) -> Result<T> {
    let value = it
        .next()
        .ok_or_else(|| Error::new(ErrorCode::UnexpectedMessage))?;
    match value.into_any().downcast::<T>() {
        Ok(boxed) => Ok(*boxed),
        Err(_) => Err(Error::new(ErrorCode::UnexpectedMessage)),
    }
}

macro_rules! impl_message_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name,)+> MessageArgs for ($($name,)+)
        where
            $($name: Any + Send + Sync,)+
        {
            fn type_list() -> Result<TypeListRef> {
                Ok(intern(&[$(registry::tag_of::<$name>()?),+]))
            }

            fn into_message(self) -> Result<Message> {
                let types = Self::type_list()?;
                Ok(Message::from_parts(
                    types,
                    vec![$(Box::new(self.$idx) as ErasedValue),+],
                ))
            }

            fn from_message(msg: Message) -> Result<Self> {
                let expected = Self::type_list()?;
                if !same_list(msg.types(), expected) {
                    return Err(signature_mismatch(&msg));
                }
                let mut it = msg.into_values()?.into_iter();
                Ok(($(next_value::<$name>(&mut it)?,)+))
            }
        }
    };
}

impl_message_args!(A: 0);
impl_message_args!(A: 0, B: 1);
impl_message_args!(A: 0, B: 1, C: 2);
impl_message_args!(A: 0, B: 1, C: 2, D: 3);

/// Builds a [`Message`] from up to four values, yielding `Result<Message>`.
#[macro_export]
macro_rules! message {
    () => {
        ::core::result::Result::Ok($crate::Message::unit())
    };
    ($a:expr $(,)?) => {
        $crate::Message::of($a)
    };
    ($a:expr, $b:expr $(,)?) => {
        $crate::Message::of2($a, $b)
    };
    ($a:expr, $b:expr, $c:expr $(,)?) => {
        $crate::Message::of3($a, $b, $c)
    };
    ($a:expr, $b:expr, $c:expr, $d:expr $(,)?) => {
        $crate::Message::of4($a, $b, $c, $d)
    };
}
