use std::{fmt, sync::Arc};

use crate::value::{ValType, Value};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Host function body. Receives one [`Value`] per declared parameter.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync>;

#[derive(Clone)]
pub enum FunctionBody {
    /// Implemented by the host and callable from the guest.
    Host(HostFn),
    /// Implemented in the guest; the host only encodes calls to it.
    Guest,
}

/// Name and signature of one callable unit, plus its body.
#[derive(Clone)]
pub struct FunctionDescriptor {
    name: String,
    params: Vec<ValType>,
    ret: ValType,
    body: FunctionBody,
}

impl FunctionDescriptor {
    pub fn host<F>(
        name: impl Into<String>,
        params: impl Into<Vec<ValType>>,
        ret: ValType,
        body: F,
    ) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.into(),
            ret,
            body: FunctionBody::Host(Arc::new(body)),
        }
    }

    pub fn guest(name: impl Into<String>, params: impl Into<Vec<ValType>>, ret: ValType) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
            ret,
            body: FunctionBody::Guest,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    #[must_use]
    pub const fn ret(&self) -> ValType {
        self.ret
    }

    #[must_use]
    pub const fn body(&self) -> &FunctionBody {
        &self.body
    }

    /// Run the host body.
    ///
    /// # Errors
    /// Returns the body's own error, or an error if this describes a guest
    /// function.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, BoxError> {
        match &self.body {
            FunctionBody::Host(f) => f(args),
            FunctionBody::Guest => Err(format!(
                "`{}` is implemented by the guest and cannot be invoked on the host",
                self.name
            )
            .into()),
        }
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .field(
                "body",
                &match self.body {
                    FunctionBody::Host(_) => "<host>",
                    FunctionBody::Guest => "<guest>",
                },
            )
            .finish()
    }
}
