//! Adapter from guest promises to host continuations.
//!
//! A guest result counts as a promise when it exposes callable `then` and
//! `catch`. The continuation fires exactly once, on the worker thread, from
//! whichever of the two settles first. Anything else settles immediately
//! with `null`.

use std::cell::RefCell;
use std::rc::Rc;

use boa_engine::object::builtins::JsFunction;
use boa_engine::object::FunctionObjectBuilder;
use boa_engine::{js_string, Context, JsObject, JsValue, NativeFunction};

/// How a guest promise ended.
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Resolved(JsValue),
    Rejected(JsValue),
}

/// Host code to run once a guest value settles. Must not capture
/// GC-managed values.
pub(crate) type Continuation = Box<dyn FnOnce(Settlement, &mut Context)>;

type Slot = Rc<RefCell<Option<Continuation>>>;

fn hooks(value: &JsValue, context: &mut Context) -> Option<(JsObject, JsObject)> {
    let object = value.as_object()?;
    let then = object.get(js_string!("then"), context).ok()?;
    let catch = object.get(js_string!("catch"), context).ok()?;
    Some((then.as_callable()?.clone(), catch.as_callable()?.clone()))
}

pub(crate) fn is_thenable(value: &JsValue, context: &mut Context) -> bool {
    hooks(value, context).is_some()
}

/// Hand `value`'s eventual outcome to `continuation`.
pub(crate) fn settle(value: JsValue, context: &mut Context, continuation: Continuation) {
    let Some((then, catch)) = hooks(&value, context) else {
        tracing::warn!("guest result is not a promise, resolving with null");
        continuation(Settlement::Resolved(JsValue::null()), context);
        return;
    };

    let slot: Slot = Rc::new(RefCell::new(Some(continuation)));
    let on_resolve = reaction(context, Rc::clone(&slot), false);
    let on_reject = reaction(context, Rc::clone(&slot), true);

    if let Err(e) = then.call(&value, &[on_resolve.into()], context) {
        let reason = e.to_opaque(context);
        fire(&slot, Settlement::Rejected(reason), context);
        return;
    }
    if let Err(e) = catch.call(&value, &[on_reject.into()], context) {
        let reason = e.to_opaque(context);
        fire(&slot, Settlement::Rejected(reason), context);
    }
}

fn fire(slot: &Slot, settlement: Settlement, context: &mut Context) {
    let continuation = slot.borrow_mut().take();
    if let Some(continuation) = continuation {
        continuation(settlement, context);
    }
}

fn reaction(context: &mut Context, slot: Slot, rejected: bool) -> JsFunction {
    // SAFETY: the closure owns only an `Rc` of host continuations, which
    // never hold GC-managed values, so nothing here needs tracing.
    let function = unsafe {
        NativeFunction::from_closure(move |_this, args, context| {
            let value = args.first().cloned().unwrap_or_default();
            let settlement = if rejected {
                Settlement::Rejected(value)
            } else {
                Settlement::Resolved(value)
            };
            fire(&slot, settlement, context);
            Ok(JsValue::undefined())
        })
    };
    FunctionObjectBuilder::new(context.realm(), function)
        .length(1)
        .build()
}

// ─── Tests ──────────────────────────────────────────────────────────────
