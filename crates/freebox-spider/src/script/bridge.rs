//! Conversions between guest JS values and host values.

use boa_engine::object::builtins::{JsArray, JsArrayBuffer, JsUint8Array};
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsResult, JsString, JsValue};
use freebox_relay::{Content, RelayResponse};

pub(crate) fn js_str(text: &str) -> JsValue {
    JsValue::from(JsString::from(text))
}

/// Call a function hanging off a global object, e.g. `JSON.stringify`.
pub(crate) fn call_global(
    context: &mut Context,
    object: &str,
    function: &str,
    args: &[JsValue],
) -> JsResult<JsValue> {
    let global = context.global_object();
    let holder = global.get(JsString::from(object), context)?;
    let holder = holder.as_object().cloned().ok_or_else(|| {
        boa_engine::JsNativeError::typ().with_message(format!("{object} is not an object"))
    })?;
    let callee = holder.get(JsString::from(function), context)?;
    let callee = callee.as_callable().cloned().ok_or_else(|| {
        boa_engine::JsNativeError::typ()
            .with_message(format!("{object}.{function} is not a function"))
    })?;
    callee.call(&JsValue::from(holder), args, context)
}

/// `JSON.stringify`, with `"{}"` for null, undefined and failures.
pub(crate) fn stringify(value: &JsValue, context: &mut Context) -> String {
    if value.is_null_or_undefined() {
        return "{}".to_string();
    }
    match call_global(context, "JSON", "stringify", &[value.clone()]) {
        Ok(out) => match out.as_string() {
            Some(text) => text.to_std_string_escaped(),
            None => "{}".to_string(),
        },
        Err(e) => {
            tracing::error!("stringify failed: {e}");
            "{}".to_string()
        }
    }
}

/// Host text for a guest result: strings pass through, null/undefined
/// become empty, anything else is JSON-encoded.
pub(crate) fn to_text(value: &JsValue, context: &mut Context) -> String {
    if value.is_null_or_undefined() {
        return String::new();
    }
    if let Some(text) = value.as_string() {
        return text.to_std_string_escaped();
    }
    if value.is_object() {
        return stringify(value, context);
    }
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default()
}

pub(crate) fn parse_json(text: &str, context: &mut Context) -> JsResult<JsValue> {
    call_global(context, "JSON", "parse", &[js_str(text)])
}

// ─── Arguments ──────────────────────────────────────────────────────────

pub(crate) fn arg_string(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get(index) {
        None => Ok(String::new()),
        Some(value) if value.is_null_or_undefined() => Ok(String::new()),
        Some(value) => match value.as_string() {
            Some(text) => Ok(text.to_std_string_escaped()),
            None => Ok(value.to_string(context)?.to_std_string_escaped()),
        },
    }
}

pub(crate) fn arg_opt_string(
    args: &[JsValue],
    index: usize,
    context: &mut Context,
) -> JsResult<Option<String>> {
    match args.get(index) {
        Some(value) if !value.is_null_or_undefined() => arg_string(args, index, context).map(Some),
        _ => Ok(None),
    }
}

pub(crate) fn arg_bool(args: &[JsValue], index: usize) -> bool {
    args.get(index).is_some_and(JsValue::to_boolean)
}

/// Like [`arg_bool`], but a missing or null argument reads as `default`.
pub(crate) fn arg_bool_or(args: &[JsValue], index: usize, default: bool) -> bool {
    match args.get(index) {
        Some(value) if !value.is_null_or_undefined() => value.to_boolean(),
        _ => default,
    }
}

pub(crate) fn arg_i32(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<i32> {
    match args.get(index) {
        Some(value) => value.to_i32(context),
        None => Ok(0),
    }
}

// ─── Relay responses ────────────────────────────────────────────────────

/// The `{code, headers, content}` object scripts receive from `http`.
///
/// `code` is `""` when no response arrived; headers seen once are strings,
/// repeated ones arrays; content follows the request's buffer mode.
pub(crate) fn response_to_js(response: &RelayResponse, context: &mut Context) -> JsResult<JsValue> {
    let headers = ObjectInitializer::new(context).build();
    for (name, values) in &response.headers {
        let value = match values.as_slice() {
            [single] => js_str(single),
            many => JsArray::from_iter(many.iter().map(|v| js_str(v)), context).into(),
        };
        headers.set(JsString::from(name.as_str()), value, false, context)?;
    }

    let code = match response.code {
        Some(code) => JsValue::from(i32::from(code)),
        None => js_str(""),
    };
    let content = match &response.content {
        Content::Text(text) => js_str(text),
        Content::Base64(encoded) => js_str(encoded),
        Content::Binary(bytes) => JsArrayBuffer::from_byte_block(bytes.to_vec(), context)?.into(),
        Content::Raw(bytes) => JsUint8Array::from_iter(bytes.iter().copied(), context)?.into(),
        Content::Empty => js_str(""),
    };

    Ok(ObjectInitializer::new(context)
        .property(js_string!("code"), code, Attribute::all())
        .property(js_string!("headers"), headers, Attribute::all())
        .property(js_string!("content"), content, Attribute::all())
        .build()
        .into())
}

/// Bytes held by an `ArrayBuffer` or `Uint8Array`; `None` for anything else.
pub(crate) fn bytes_from_js(value: &JsValue, context: &mut Context) -> JsResult<Option<Vec<u8>>> {
    let Some(object) = value.as_object() else {
        return Ok(None);
    };
    if let Ok(buffer) = JsArrayBuffer::from_object(object.clone()) {
        return Ok(buffer.data().map(|data| data.to_vec()));
    }
    if let Ok(array) = JsUint8Array::from_object(object.clone()) {
        let len = array.length(context)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(array.get(i, context)?.to_uint8(context)?);
        }
        return Ok(Some(out));
    }
    Ok(None)
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn eval(context: &mut Context, code: &str) -> JsValue {
        context.eval(Source::from_bytes(code)).unwrap()
    }

    #[test]
    fn test_stringify_and_to_text() {
        let mut context = Context::default();
        let object = eval(&mut context, "({a: 1, b: [true]})");
        assert_eq!(stringify(&object, &mut context), r#"{"a":1,"b":[true]}"#);
        assert_eq!(stringify(&JsValue::undefined(), &mut context), "{}");
        assert_eq!(to_text(&JsValue::null(), &mut context), "");
        assert_eq!(to_text(&js_str("plain"), &mut context), "plain");
        assert_eq!(to_text(&object, &mut context), r#"{"a":1,"b":[true]}"#);
        assert_eq!(to_text(&JsValue::from(7), &mut context), "7");
    }

    #[test]
    fn test_args() {
        let mut context = Context::default();
        let args = [js_str("x"), JsValue::from(true), JsValue::null(), JsValue::from(42)];
        assert_eq!(arg_string(&args, 0, &mut context).unwrap(), "x");
        assert_eq!(arg_string(&args, 2, &mut context).unwrap(), "");
        assert_eq!(arg_string(&args, 3, &mut context).unwrap(), "42");
        assert_eq!(arg_opt_string(&args, 2, &mut context).unwrap(), None);
        assert!(arg_bool(&args, 1));
        assert!(!arg_bool(&args, 9));
        assert!(arg_bool_or(&args, 2, true));
        assert_eq!(arg_i32(&args, 3, &mut context).unwrap(), 42);
    }

    #[test]
    fn test_response_to_js_shapes() {
        let mut context = Context::default();
        let mut headers = BTreeMap::new();
        headers.insert("set-cookie".to_string(), vec!["a=1".to_string(), "b=2".to_string()]);
        headers.insert("server".to_string(), vec!["mock".to_string()]);
        let response = RelayResponse {
            code: Some(200),
            headers,
            content: Content::Text("body".into()),
        };
        let value = response_to_js(&response, &mut context).unwrap();
        context
            .register_global_property(js_string!("res"), value, Attribute::all())
            .unwrap();
        let summary = eval(
            &mut context,
            "[res.code, res.content, res.headers.server, res.headers['set-cookie'].length].join('|')",
        );
        assert_eq!(to_text(&summary, &mut context), "200|body|mock|2");
    }

    #[test]
    fn test_empty_response_code_is_blank() {
        let mut context = Context::default();
        let value = response_to_js(&RelayResponse::empty(), &mut context).unwrap();
        let code = value.as_object().unwrap().get(js_string!("code"), &mut context).unwrap();
        assert_eq!(to_text(&code, &mut context), "");
    }

    #[test]
    fn test_binary_content_round_trips() {
        let mut context = Context::default();
        for content in [
            Content::Binary(Bytes::from_static(&[1, 2, 255])),
            Content::Raw(Bytes::from_static(&[1, 2, 255])),
        ] {
            let response = RelayResponse {
                code: Some(200),
                headers: BTreeMap::new(),
                content,
            };
            let value = response_to_js(&response, &mut context).unwrap();
            let body = value
                .as_object()
                .unwrap()
                .get(js_string!("content"), &mut context)
                .unwrap();
            assert_eq!(bytes_from_js(&body, &mut context).unwrap(), Some(vec![1, 2, 255]));
        }
        assert_eq!(bytes_from_js(&js_str("text"), &mut context).unwrap(), None);
    }
}
