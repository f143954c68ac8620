//! Mapping templates written as Rhai scripts.
//!
//! The script sees a `context` constant and the `util`/`utils` modules. Its
//! final value is the rendered output: a string is used verbatim, anything
//! else (typically an object map) is serialized to JSON.

use std::fmt;

use rhai::plugin::*;
use rhai::serde::to_dynamic;
use rhai::Dynamic;
use rhai::Engine;
use rhai::EvalAltResult;
use rhai::Scope;
use tower::BoxError;

use super::TemplateContext;
use super::TemplateRenderer;

// We have to keep the modules that we export using `export_module` inline because
// error[E0658]: non-inline modules in proc macro input are unstable
#[export_module]
mod template_util {
    pub(crate) type Util = crate::template::TemplateUtil;

    #[rhai_fn(pure, return_raw)]
    pub(crate) fn to_json(value: &mut Dynamic) -> Result<String, Box<EvalAltResult>> {
        serde_json::to_string(value).map_err(|e| e.to_string().into())
    }

    #[rhai_fn(pure, return_raw)]
    pub(crate) fn parse_json(input: &mut ImmutableString) -> Result<Dynamic, Box<EvalAltResult>> {
        serde_json::from_str(input).map_err(|e| e.to_string().into())
    }

    pub(crate) fn auto_id() -> String {
        Util::default().auto_id()
    }

    #[rhai_fn(pure)]
    pub(crate) fn url_encode(input: &mut ImmutableString) -> String {
        Util::default().url_encode(input)
    }

    #[rhai_fn(pure, return_raw)]
    pub(crate) fn url_decode(input: &mut ImmutableString) -> Result<String, Box<EvalAltResult>> {
        Util::default()
            .url_decode(input)
            .map_err(|e| e.to_string().into())
    }

    #[rhai_fn(pure)]
    pub(crate) fn base64_encode(input: &mut ImmutableString) -> String {
        Util::default().base64_encode(input)
    }

    #[rhai_fn(pure, return_raw)]
    pub(crate) fn base64_decode(input: &mut ImmutableString) -> Result<String, Box<EvalAltResult>> {
        Util::default()
            .base64_decode(input)
            .map_err(|e| e.to_string().into())
    }

    #[rhai_fn(pure)]
    pub(crate) fn escape_javascript(input: &mut ImmutableString) -> String {
        Util::default().escape_javascript(input)
    }

    #[rhai_fn(pure)]
    pub(crate) fn is_null(value: &mut Dynamic) -> bool {
        value.is_unit()
    }

    #[rhai_fn(pure)]
    pub(crate) fn is_null_or_empty(value: &mut Dynamic) -> bool {
        rhai::serde::from_dynamic::<serde_json_bytes::Value>(value)
            .map(|value| Util::default().is_null_or_empty(&value))
            .unwrap_or(false)
    }

    pub(crate) fn now_epoch_seconds() -> i64 {
        Util::default().now_epoch_seconds()
    }

    pub(crate) fn now_epoch_milliseconds() -> i64 {
        Util::default().now_epoch_milliseconds()
    }

    pub(crate) fn now_iso8601() -> String {
        Util::default().now_iso8601()
    }
}

/// Renders mapping templates with a shared Rhai engine.
pub struct RhaiRenderer {
    engine: Engine,
}

impl fmt::Debug for RhaiRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiRenderer").finish_non_exhaustive()
    }
}

impl Default for RhaiRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RhaiRenderer {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        let util: rhai::Shared<rhai::Module> = exported_module!(template_util).into();

        engine
            .set_max_expr_depths(0, 0)
            .on_print(|message| {
                tracing::info!(%message, target = "mapping_template");
            })
            .on_debug(|message, source, position| {
                tracing::debug!(%message, source = source.unwrap_or_default(), %position, target = "mapping_template");
            })
            .register_static_module("util", util.clone())
            .register_static_module("utils", util);

        Self { engine }
    }
}

impl TemplateRenderer for RhaiRenderer {
    fn render(&self, template: &str, context: &TemplateContext) -> Result<String, BoxError> {
        let mut scope = Scope::new();
        let values = to_dynamic(&context.context).map_err(|e| e.to_string())?;
        scope.push_constant("context", values);

        let output: Dynamic = self
            .engine
            .eval_with_scope(&mut scope, template)
            .map_err(|e| e.to_string())?;

        if output.is_string() {
            Ok(output.into_string().map_err(|e| e.to_string())?)
        } else {
            Ok(serde_json::to_string(&output)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;
    use serde_json_bytes::Value;

    use super::*;

    fn context() -> TemplateContext {
        TemplateContext::from_result(
            &json!({ "name": "Alice" }),
            &Value::Null,
            json!({ "id": "42" }).as_object().unwrap(),
            &json!({ "username": "default" }),
            &http::HeaderMap::new(),
        )
    }

    fn render(template: &str) -> Result<Value, BoxError> {
        let output = RhaiRenderer::new().render(template, &context())?;
        Ok(serde_json::from_str(&output)?)
    }

    #[test]
    fn object_maps_render_as_json() {
        let output = render(
            r#"#{
                version: "2017-02-28",
                operation: "Invoke",
                payload: #{ id: context.arguments.id }
            }"#,
        )
        .unwrap();

        assert_eq!(
            output,
            json!({ "version": "2017-02-28", "operation": "Invoke", "payload": { "id": "42" } })
        );
    }

    #[test]
    fn strings_are_used_verbatim() {
        let output = RhaiRenderer::new()
            .render(r#"`{"name": "${context.result.name}"}`"#, &context())
            .unwrap();
        assert_eq!(output, r#"{"name": "Alice"}"#);
    }

    #[test]
    fn util_and_utils_are_the_same_helpers() {
        let render_text =
            |template: &str| RhaiRenderer::new().render(template, &context()).unwrap();

        assert_eq!(
            render_text("util::to_json(context.result)"),
            r#"{"name":"Alice"}"#
        );
        assert_eq!(render_text(r#"utils::base64_encode("hello")"#), "aGVsbG8=");
        assert_eq!(
            render_text(r#"util::parse_json("{\"a\": [1, 2]}")"#),
            r#"{"a":[1,2]}"#
        );
        assert_eq!(render_text("util::auto_id().len()"), "36");
        assert_eq!(render_text("util::is_null(context.source)"), "true");
        assert_eq!(render_text(r#"utils::is_null_or_empty("")"#), "true");
        assert_eq!(render_text("utils::is_null_or_empty(context.arguments)"), "false");
    }

    #[test]
    fn missing_properties_render_as_null() {
        assert_eq!(
            render("#{ value: context.arguments.missing }").unwrap(),
            json!({ "value": null })
        );
    }

    #[test]
    fn script_errors_are_reported() {
        let error = RhaiRenderer::new()
            .render("this is not rhai (", &context())
            .unwrap_err();
        assert!(!error.to_string().is_empty());
    }
}
