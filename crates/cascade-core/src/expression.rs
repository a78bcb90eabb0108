//! Expression resolution for step parameters and `when` clauses.
//!
//! The engine consumes expression evaluation through the [`ExpressionService`]
//! trait; [`JexlExpressionService`] is the in-process default, wrapping
//! `jexl_eval` with a small set of standard transforms. Placeholders use the
//! `<+expression>` form inside otherwise plain strings; a string that is
//! exactly one placeholder resolves to the evaluated value's JSON type, while
//! embedded placeholders stringify.
//!
//! **Security note:** runtime values are always passed as context objects,
//! NEVER interpolated into expression strings.

use serde_json::{Map, Value, json};

use cascade_types::ambiance::Ambiance;
use cascade_types::plan::{ExpressionMode, PlanNode};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression work.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("unresolved expression in strict mode: {0}")]
    Unresolved(String),
}

// ---------------------------------------------------------------------------
// ExpressionService trait
// ---------------------------------------------------------------------------

/// External expression-evaluation seam.
///
/// `resolve` substitutes every placeholder in a nested parameter structure;
/// `evaluate` computes a single expression. In lenient mode an unresolvable
/// expression passes through as literal text instead of failing.
pub trait ExpressionService: Send + Sync {
    fn resolve(
        &self,
        ambiance: &Ambiance,
        raw: &Value,
        mode: ExpressionMode,
        enabled_flags: &[String],
    ) -> Result<Value, ExpressionError>;

    fn evaluate(
        &self,
        ambiance: &Ambiance,
        expression: &str,
        mode: ExpressionMode,
    ) -> Result<Value, ExpressionError>;
}

// ---------------------------------------------------------------------------
// JexlExpressionService
// ---------------------------------------------------------------------------

/// JEXL-backed expression service with standard transforms registered.
///
/// The evaluation context exposes `setup` (scope keys), `metadata`,
/// `ambiance` (ids and fqn), `flags`, `settings`, and any extra root values
/// supplied via [`Self::with_context`].
#[derive(Debug, Default, Clone)]
pub struct JexlExpressionService {
    extra_context: Map<String, Value>,
}

impl JexlExpressionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root-level context value available to every expression.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_context.insert(key.into(), value);
        self
    }

    fn evaluation_context(&self, ambiance: &Ambiance, enabled_flags: &[String]) -> Value {
        let mut context = Map::new();
        context.insert("setup".to_string(), json!(ambiance.setup_abstractions));
        context.insert(
            "metadata".to_string(),
            json!({
                "pipeline_identifier": ambiance.metadata.pipeline_identifier,
                "run_sequence": ambiance.metadata.run_sequence,
                "execution_mode": ambiance.metadata.execution_mode,
            }),
        );
        context.insert(
            "ambiance".to_string(),
            json!({
                "plan_id": ambiance.plan_id,
                "plan_execution_id": ambiance.plan_execution_id,
                "fqn": ambiance.fqn(),
                "identifier": ambiance.current_level().map(|l| l.identifier.clone()),
            }),
        );
        context.insert("flags".to_string(), json!(enabled_flags));
        context.insert("settings".to_string(), json!(ambiance.metadata.settings));
        for (key, value) in &self.extra_context {
            context.insert(key.clone(), value.clone());
        }
        Value::Object(context)
    }

    fn evaluator() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }

    fn eval_in_context(expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        Self::evaluator()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    fn resolve_value(
        value: &Value,
        context: &Value,
        mode: ExpressionMode,
    ) -> Result<Value, ExpressionError> {
        match value {
            Value::String(text) => Self::resolve_string(text, context, mode),
            Value::Array(items) => {
                let resolved: Result<Vec<Value>, ExpressionError> = items
                    .iter()
                    .map(|item| Self::resolve_value(item, context, mode))
                    .collect();
                Ok(Value::Array(resolved?))
            }
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), Self::resolve_value(item, context, mode)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(
        text: &str,
        context: &Value,
        mode: ExpressionMode,
    ) -> Result<Value, ExpressionError> {
        // A string that is exactly one placeholder keeps the evaluated type.
        if let Some(inner) = whole_placeholder(text) {
            return match Self::eval_in_context(inner, context) {
                Ok(Value::Null) | Err(_) if mode == ExpressionMode::Lenient => {
                    Ok(Value::String(text.to_string()))
                }
                Ok(Value::Null) => Err(ExpressionError::Unresolved(inner.to_string())),
                Ok(value) => Ok(value),
                Err(err) => Err(err),
            };
        }

        let mut result = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("<+") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('>') else {
                // No closing marker; keep the remainder verbatim.
                result.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let expression = &after[..end];
            match Self::eval_in_context(expression, context) {
                Ok(Value::Null) | Err(_) if mode == ExpressionMode::Lenient => {
                    result.push_str(&rest[start..start + 2 + end + 1]);
                }
                Ok(Value::Null) => return Err(ExpressionError::Unresolved(expression.to_string())),
                Ok(value) => result.push_str(&value_to_string(&value)),
                Err(err) => return Err(err),
            }
            rest = &after[end + 1..];
        }
        result.push_str(rest);
        Ok(Value::String(result))
    }
}

impl ExpressionService for JexlExpressionService {
    fn resolve(
        &self,
        ambiance: &Ambiance,
        raw: &Value,
        mode: ExpressionMode,
        enabled_flags: &[String],
    ) -> Result<Value, ExpressionError> {
        let context = self.evaluation_context(ambiance, enabled_flags);
        Self::resolve_value(raw, &context, mode)
    }

    fn evaluate(
        &self,
        ambiance: &Ambiance,
        expression: &str,
        mode: ExpressionMode,
    ) -> Result<Value, ExpressionError> {
        let context = self.evaluation_context(ambiance, &ambiance.enabled_feature_flags());
        match Self::eval_in_context(expression, &context) {
            Ok(value) => Ok(value),
            Err(_) if mode == ExpressionMode::Lenient => {
                Ok(Value::String(expression.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("<+")?.strip_suffix('>')?;
    // Reject strings with a second placeholder opener; those are embedded.
    if inner.contains("<+") { None } else { Some(inner) }
}

/// Stringify an evaluated value for embedding into surrounding text.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// ParameterResolver
// ---------------------------------------------------------------------------

/// Resolved parameters plus the redacted display view.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParameters {
    /// Fully substituted parameters; what the step actually executes with.
    pub resolved_params: Value,
    /// The same structure with excluded key paths removed. Display only --
    /// must never be treated as executable input.
    pub step_inputs: Value,
}

/// Resolves a node's templated step parameters against an ambiance.
///
/// Stateless; all logic lives in associated functions.
pub struct ParameterResolver;

impl ParameterResolver {
    pub fn resolve<X: ExpressionService>(
        service: &X,
        ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<ResolvedParameters, ExpressionError> {
        let resolved_params = service.resolve(
            ambiance,
            &node.step_parameters,
            node.expression_mode,
            &ambiance.enabled_feature_flags(),
        )?;
        let step_inputs = remove_key_paths(&resolved_params, &node.excluded_step_input_keys);
        Ok(ResolvedParameters {
            resolved_params,
            step_inputs,
        })
    }
}

/// Returns `value` with each dotted key path removed.
///
/// Pure: the input is untouched and unrelated branches of the result compare
/// equal to the input. A path whose intermediate segments do not lead
/// through objects is ignored.
pub fn remove_key_paths(value: &Value, paths: &[String]) -> Value {
    if paths.is_empty() {
        return value.clone();
    }
    let mut result = value.clone();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() {
            continue;
        }
        let mut current = &mut result;
        for (i, segment) in segments.iter().enumerate() {
            if i + 1 == segments.len() {
                if let Value::Object(map) = current {
                    map.remove(*segment);
                }
                break;
            }
            match current.get_mut(*segment) {
                Some(next @ Value::Object(_)) => current = next,
                _ => break,
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::ambiance::setup_keys;
    use cascade_types::step::{StepCategory, StepType};
    use serde_json::json;

    fn sample_ambiance() -> Ambiance {
        let mut ambiance = Ambiance::new("plan-1", "exec-1");
        ambiance
            .setup_abstractions
            .insert(setup_keys::ACCOUNT_ID.to_string(), "acct-42".to_string());
        ambiance.metadata.pipeline_identifier = "deploy_service".to_string();
        ambiance
    }

    fn service() -> JexlExpressionService {
        JexlExpressionService::new().with_context(
            "env",
            json!({ "region": "us-east-1", "replicas": 3, "debug": false }),
        )
    }

    // -----------------------------------------------------------------------
    // evaluate
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_against_setup_context() {
        let value = service()
            .evaluate(&sample_ambiance(), "setup.account_id", ExpressionMode::Strict)
            .unwrap();
        assert_eq!(value, json!("acct-42"));
    }

    #[test]
    fn test_evaluate_boolean_expression() {
        let value = service()
            .evaluate(&sample_ambiance(), "env.replicas > 1", ExpressionMode::Strict)
            .unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn test_evaluate_transform() {
        let value = service()
            .evaluate(
                &sample_ambiance(),
                "env.region|upper",
                ExpressionMode::Strict,
            )
            .unwrap();
        assert_eq!(value, json!("US-EAST-1"));
    }

    #[test]
    fn test_evaluate_lenient_falls_back_to_literal() {
        let value = service()
            .evaluate(&sample_ambiance(), "][ not jexl", ExpressionMode::Lenient)
            .unwrap();
        assert_eq!(value, json!("][ not jexl"));
    }

    #[test]
    fn test_evaluate_strict_propagates_error() {
        let result = service().evaluate(&sample_ambiance(), "][ not jexl", ExpressionMode::Strict);
        assert!(matches!(result, Err(ExpressionError::EvalFailed(_))));
    }

    // -----------------------------------------------------------------------
    // resolve
    // -----------------------------------------------------------------------

    #[test]
    fn test_resolve_whole_placeholder_keeps_type() {
        let raw = json!({ "replicas": "<+env.replicas>", "debug": "<+env.debug>" });
        let resolved = service()
            .resolve(&sample_ambiance(), &raw, ExpressionMode::Strict, &[])
            .unwrap();
        assert_eq!(resolved["replicas"], json!(3));
        assert_eq!(resolved["debug"], json!(false));
    }

    #[test]
    fn test_resolve_embedded_placeholder_stringifies() {
        let raw = json!({ "greeting": "region is <+env.region> (<+env.replicas> replicas)" });
        let resolved = service()
            .resolve(&sample_ambiance(), &raw, ExpressionMode::Strict, &[])
            .unwrap();
        assert_eq!(
            resolved["greeting"],
            json!("region is us-east-1 (3 replicas)")
        );
    }

    #[test]
    fn test_resolve_nested_structures() {
        let raw = json!({
            "spec": {
                "targets": ["<+env.region>", "literal"],
                "account": "<+setup.account_id>"
            }
        });
        let resolved = service()
            .resolve(&sample_ambiance(), &raw, ExpressionMode::Strict, &[])
            .unwrap();
        assert_eq!(resolved["spec"]["targets"], json!(["us-east-1", "literal"]));
        assert_eq!(resolved["spec"]["account"], json!("acct-42"));
    }

    #[test]
    fn test_resolve_lenient_leaves_unresolved_literal() {
        let raw = json!({ "value": "<+missing.key>" });
        let resolved = service()
            .resolve(&sample_ambiance(), &raw, ExpressionMode::Lenient, &[])
            .unwrap();
        assert_eq!(resolved["value"], json!("<+missing.key>"));
    }

    #[test]
    fn test_resolve_strict_errors_on_unresolved() {
        let raw = json!({ "value": "<+][ broken>" });
        let result = service().resolve(&sample_ambiance(), &raw, ExpressionMode::Strict, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_plain_values_untouched() {
        let raw = json!({ "n": 7, "flag": true, "text": "no placeholders" });
        let resolved = service()
            .resolve(&sample_ambiance(), &raw, ExpressionMode::Strict, &[])
            .unwrap();
        assert_eq!(resolved, raw);
    }

    // -----------------------------------------------------------------------
    // remove_key_paths
    // -----------------------------------------------------------------------

    #[test]
    fn test_remove_top_level_key() {
        let value = json!({ "script": "echo hi", "timeout": 30 });
        let trimmed = remove_key_paths(&value, &["script".to_string()]);
        assert_eq!(trimmed, json!({ "timeout": 30 }));
        // Input untouched.
        assert_eq!(value["script"], json!("echo hi"));
    }

    #[test]
    fn test_remove_nested_key_leaves_unrelated_branches() {
        let value = json!({
            "spec": { "secret": "s3cr3t", "image": "app:1" },
            "infra": { "region": "us-east-1" }
        });
        let trimmed = remove_key_paths(&value, &["spec.secret".to_string()]);
        assert_eq!(trimmed["spec"], json!({ "image": "app:1" }));
        assert_eq!(trimmed["infra"], value["infra"]);
    }

    #[test]
    fn test_remove_missing_path_is_noop() {
        let value = json!({ "spec": { "image": "app:1" } });
        let trimmed = remove_key_paths(
            &value,
            &["spec.absent".to_string(), "nope.deep.key".to_string()],
        );
        assert_eq!(trimmed, value);
    }

    #[test]
    fn test_remove_path_through_non_object_is_noop() {
        let value = json!({ "spec": "just a string" });
        let trimmed = remove_key_paths(&value, &["spec.secret".to_string()]);
        assert_eq!(trimmed, value);
    }

    #[test]
    fn test_remove_multiple_paths() {
        let value = json!({
            "a": { "x": 1, "y": 2 },
            "b": { "z": 3 }
        });
        let trimmed = remove_key_paths(&value, &["a.x".to_string(), "b.z".to_string()]);
        assert_eq!(trimmed, json!({ "a": { "y": 2 }, "b": {} }));
    }

    // -----------------------------------------------------------------------
    // ParameterResolver
    // -----------------------------------------------------------------------

    #[test]
    fn test_parameter_resolver_produces_both_views() {
        let mut node = PlanNode::new(
            "n-1",
            "deploy",
            StepType::new("deployment", StepCategory::Step),
        );
        node.step_parameters = json!({
            "account": "<+setup.account_id>",
            "credentials": { "token": "<+env.region>" }
        });
        node.excluded_step_input_keys = vec!["credentials.token".to_string()];

        let resolved =
            ParameterResolver::resolve(&service(), &sample_ambiance(), &node).unwrap();
        assert_eq!(resolved.resolved_params["account"], json!("acct-42"));
        assert_eq!(
            resolved.resolved_params["credentials"]["token"],
            json!("us-east-1")
        );
        assert_eq!(resolved.step_inputs["account"], json!("acct-42"));
        assert_eq!(resolved.step_inputs["credentials"], json!({}));
    }
}
