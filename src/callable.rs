//! Callable descriptors and their wire codec.
//!
//! A callable is encoded into the `callable_type` / `callable` / `namespace`
//! / `object_instance` columns of a job row and reconstructed by the worker.
//! Closure payloads carry an HMAC-SHA256 tag over `{name, captured}` so a
//! worker never acts on a closure row altered by someone with database access
//! but without the application secret.

use crate::errors::{Error, Result};
use crate::job::CallableKind;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A unit of work the worker knows how to invoke.
///
/// There is no dynamic evaluation in Rust, so the `Closure` variant refers to
/// a registered, named function plus a JSON-encoded captured environment;
/// the integrity tag covers both.
#[derive(Debug, Clone, PartialEq)]
pub enum Callable {
    /// A plain named function registered with the worker.
    Function {
        /// Registered symbol name.
        name: String,
    },
    /// A static (class, method) pair.
    StaticMethod {
        /// Class name, stored in the `namespace` column.
        class: String,
        /// Method name.
        method: String,
    },
    /// A (class, method) pair bound to encoded receiver state.
    InstanceMethod {
        /// Class name, stored in the `namespace` column.
        class: String,
        /// Method name.
        method: String,
        /// Receiver state, stored in the `object_instance` column.
        instance: Value,
    },
    /// A registered named closure with a captured environment.
    Closure {
        /// Registered closure name.
        name: String,
        /// Captured environment, encoded alongside the name.
        captured: Value,
    },
}

impl Callable {
    /// A [`Callable::Function`].
    pub fn function(name: impl Into<String>) -> Self {
        Callable::Function { name: name.into() }
    }

    /// A [`Callable::StaticMethod`].
    pub fn static_method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Callable::StaticMethod {
            class: class.into(),
            method: method.into(),
        }
    }

    /// An [`Callable::InstanceMethod`] with encoded receiver state.
    pub fn instance_method(
        class: impl Into<String>,
        method: impl Into<String>,
        instance: Value,
    ) -> Self {
        Callable::InstanceMethod {
            class: class.into(),
            method: method.into(),
            instance,
        }
    }

    /// A [`Callable::Closure`] over a registered name and captured environment.
    pub fn closure(name: impl Into<String>, captured: Value) -> Self {
        Callable::Closure {
            name: name.into(),
            captured,
        }
    }

    /// The decoding strategy stored in `callable_type`.
    pub fn kind(&self) -> CallableKind {
        match self {
            Callable::Function { .. } => CallableKind::Function,
            Callable::StaticMethod { .. } | Callable::InstanceMethod { .. } => {
                CallableKind::ClassMethod
            }
            Callable::Closure { .. } => CallableKind::Closure,
        }
    }

    /// Default job name: the callable's textual label.
    pub fn label(&self) -> String {
        match self {
            Callable::Function { name } => name.clone(),
            Callable::StaticMethod { class, method }
            | Callable::InstanceMethod { class, method, .. } => format!("{class}::{method}"),
            Callable::Closure { name, .. } => name.clone(),
        }
    }

    /// Key the worker resolves against its [`crate::JobRegistry`].
    pub fn registry_key(&self) -> String {
        self.label()
    }

    /// The captured environment, for closure callables.
    pub fn captured(&self) -> Option<&Value> {
        match self {
            Callable::Closure { captured, .. } => Some(captured),
            _ => None,
        }
    }

    /// The encoded receiver state, for instance methods.
    pub fn instance(&self) -> Option<&Value> {
        match self {
            Callable::InstanceMethod { instance, .. } => Some(instance),
            _ => None,
        }
    }
}

/// Column values produced by encoding a [`Callable`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedCallable {
    /// Goes to `callable_type`.
    pub kind: CallableKind,
    /// Goes to `callable`.
    pub callable: String,
    /// Goes to `namespace`.
    pub namespace: Option<String>,
    /// Goes to `object_instance`.
    pub object_instance: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ClosurePayload {
    code: String,
    captured: Value,
    hmac: String,
}

/// Encoder/decoder for callable descriptors and job parameters.
#[derive(Clone)]
pub struct CallableCodec {
    key: Vec<u8>,
}

impl CallableCodec {
    /// Build a codec over the process-stable application secret.
    ///
    /// Producer and worker must construct their codecs from the same secret
    /// or every closure decode fails verification.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Encode a callable into its column values.
    pub fn encode(&self, callable: &Callable) -> Result<EncodedCallable> {
        let kind = callable.kind();
        Ok(match callable {
            // The literal name; resolution happens in the worker's registry.
            Callable::Function { name } => EncodedCallable {
                kind,
                callable: name.clone(),
                namespace: None,
                object_instance: None,
            },
            Callable::StaticMethod { class, method } => EncodedCallable {
                kind,
                callable: method.clone(),
                namespace: Some(class.clone()),
                object_instance: None,
            },
            Callable::InstanceMethod {
                class,
                method,
                instance,
            } => EncodedCallable {
                kind,
                callable: method.clone(),
                namespace: Some(class.clone()),
                object_instance: Some(encode_value(instance)),
            },
            Callable::Closure { name, captured } => {
                let payload = ClosurePayload {
                    code: name.clone(),
                    captured: captured.clone(),
                    hmac: self.tag(name, captured),
                };
                EncodedCallable {
                    kind,
                    callable: serde_json::to_string(&payload)
                        .map_err(|e| Error::InvalidCallable(e.to_string()))?,
                    namespace: None,
                    object_instance: None,
                }
            }
        })
    }

    /// Decode column values back into a callable, verifying closure integrity.
    pub fn decode(
        &self,
        kind: CallableKind,
        callable: &str,
        namespace: Option<&str>,
        object_instance: Option<&str>,
    ) -> Result<Callable> {
        match kind {
            CallableKind::Function => Ok(Callable::function(callable)),
            CallableKind::ClassMethod => {
                let class = namespace.ok_or_else(|| {
                    Error::InvalidCallable("class-method row has no namespace".into())
                })?;
                match object_instance {
                    Some(encoded) => Ok(Callable::instance_method(
                        class,
                        callable,
                        decode_value(encoded)?,
                    )),
                    None => Ok(Callable::static_method(class, callable)),
                }
            }
            CallableKind::Closure => {
                let payload: ClosurePayload = serde_json::from_str(callable)
                    .map_err(|_| Error::TamperedClosure)?;
                self.verify(&payload)?;
                Ok(Callable::closure(payload.code, payload.captured))
            }
        }
    }

    /// Encode a parameter list. Symmetric with [`CallableCodec::decode_params`]
    /// and restartable across processes.
    pub fn encode_params(&self, params: &Value) -> String {
        encode_value(params)
    }

    /// Decode a parameter list.
    pub fn decode_params(&self, encoded: &str) -> Result<Value> {
        decode_value(encoded)
    }

    fn tag(&self, code: &str, captured: &Value) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(Self::message(code, captured).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, payload: &ClosurePayload) -> Result<()> {
        let expected = hex::decode(&payload.hmac).map_err(|_| Error::TamperedClosure)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(Self::message(&payload.code, &payload.captured).as_bytes());
        // Constant-time comparison.
        mac.verify_slice(&expected).map_err(|_| Error::TamperedClosure)
    }

    // serde_json maps are ordered, so this rendering is canonical.
    fn message(code: &str, captured: &Value) -> String {
        format!("{code}\n{captured}")
    }
}

fn encode_value(value: &Value) -> String {
    value.to_string()
}

fn decode_value(encoded: &str) -> Result<Value> {
    serde_json::from_str(encoded).map_err(|e| Error::InvalidCallable(e.to_string()))
}
