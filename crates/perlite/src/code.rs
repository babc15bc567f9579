//! The uniform call surface over both execution engines.
//!
//! A [`CodeValue`] is either interpreted bytecode or a native-compiled sub;
//! every caller — sub calls, method dispatch, sort comparators, `@ISA`
//! traversal — goes through `apply` and cannot tell the two apart.
//! Replacing a native sub with an interpreted one under the same global
//! name changes nothing observable.
//!
//! `apply` also hosts the trampoline: a returned `goto &sub` / tail-call
//! marker with a target re-enters the loop instead of growing the host
//! stack.

use std::rc::Rc;

use crate::bytecode::code::Code;
use crate::bytecode::vm;
use crate::context::Context;
use crate::interp::Interp;
use crate::runtime::control::ControlKind;
use crate::runtime::error::RunError;
use crate::runtime::scalar::Scalar;
use crate::runtime::value::Value;

/// Signature of a native-compiled subroutine.
///
/// Receives the engine, the flattened argument list and the caller's
/// context, exactly like the interpreter's own frames do.
pub type NativeFn = fn(&mut Interp, &Value, Context) -> Result<Value, RunError>;

/// A native-compiled subroutine with its trace name.
#[derive(Debug)]
pub struct NativeSub {
    name: Rc<str>,
    func: NativeFn,
}

/// An invokable code value: interpreted bytecode or native code.
#[derive(Debug, Clone)]
pub enum CodeValue {
    Interpreted(Rc<Code>),
    Native(Rc<NativeSub>),
}

impl CodeValue {
    /// Wraps a native function with a trace name.
    #[must_use]
    pub fn native(name: &str, func: NativeFn) -> Self {
        CodeValue::Native(Rc::new(NativeSub {
            name: Rc::from(name),
            func,
        }))
    }

    /// The qualified name used in stack traces.
    #[must_use]
    pub fn name(&self) -> Rc<str> {
        match self {
            CodeValue::Interpreted(code) => code.qualified_name(),
            CodeValue::Native(native) => Rc::clone(&native.name),
        }
    }

    /// A stable address for stringification and identity checks.
    #[must_use]
    pub fn addr(&self) -> usize {
        match self {
            CodeValue::Interpreted(code) => Rc::as_ptr(code) as usize,
            CodeValue::Native(native) => Rc::as_ptr(native) as usize,
        }
    }

    /// True if both values denote the same code instance.
    #[must_use]
    pub fn is_same(&self, other: &CodeValue) -> bool {
        self.addr() == other.addr()
    }

    /// The interpreted code object, if this is one.
    #[must_use]
    pub fn as_interpreted(&self) -> Option<&Rc<Code>> {
        match self {
            CodeValue::Interpreted(code) => Some(code),
            CodeValue::Native(_) => None,
        }
    }

    /// Invokes the code with an argument list and calling context.
    ///
    /// `goto &sub` and tail-call markers returned by the callee are
    /// trampolined here: the target runs with the marker's argument list
    /// (or the same one) without consuming host stack. Loop-control
    /// markers pass through untouched for enclosing constructs to handle.
    pub fn apply(&self, interp: &mut Interp, args: Value, ctx: Context) -> Result<Value, RunError> {
        let ctx = ctx.resolve(Context::List);
        let mut code = self.clone();
        let mut args = args;
        loop {
            let result = match &code {
                CodeValue::Interpreted(c) => vm::run(interp, c, args.clone(), ctx)?,
                CodeValue::Native(n) => (n.func)(interp, &args, ctx)?,
            };
            if let Some(marker) = result.as_control() {
                if matches!(marker.kind, ControlKind::Goto | ControlKind::TailCall) {
                    if let Some(target) = &marker.target {
                        if let Some(marker_args) = &marker.args {
                            args = Value::Array(Rc::clone(marker_args));
                        }
                        code = target.clone();
                        continue;
                    }
                }
            }
            return Ok(result);
        }
    }

    /// Named `apply` overload: decorates the call for stack traces before
    /// delegating. Used by call sites that know the name they resolved
    /// (method dispatch, symbol-table calls).
    pub fn apply_sub(
        &self,
        sub_name: &str,
        interp: &mut Interp,
        args: Value,
        ctx: Context,
    ) -> Result<Value, RunError> {
        log::trace!("calling {sub_name}");
        self.apply(interp, args, ctx)
    }

    /// Installs this code into the global code table under a qualified
    /// name and returns the code-reference scalar. Interpreted code gets
    /// its trace name bound (first install wins).
    pub fn register_as_named_sub(&self, interp: &mut Interp, qualified: &str) -> Scalar {
        if let CodeValue::Interpreted(code) = self {
            code.bind_name(qualified);
        }
        interp.symbols_mut().set_code(qualified, self.clone());
        Scalar::Code(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(_: &mut Interp, args: &Value, _: Context) -> Result<Value, RunError> {
        let cells = args.flatten();
        let n = cells.first().map_or(0, |c| c.borrow().to_int());
        Ok(Value::int(n * 2))
    }

    #[test]
    fn test_native_apply() {
        let mut interp = Interp::new();
        let code = CodeValue::native("main::double", double);
        let result = code.apply(&mut interp, Value::int(21), Context::Scalar).unwrap();
        assert_eq!(result.scalarize().to_int(), 42);
    }

    #[test]
    fn test_register_installs_and_returns_ref() {
        let mut interp = Interp::new();
        let code = CodeValue::native("main::double", double);
        let scalar = code.register_as_named_sub(&mut interp, "main::double");
        assert!(matches!(scalar, Scalar::Code(_)));
        assert!(interp.symbols().has_code("main::double"));
    }

    #[test]
    fn test_identity() {
        let a = CodeValue::native("main::a", double);
        let b = a.clone();
        let c = CodeValue::native("main::a", double);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }
}
