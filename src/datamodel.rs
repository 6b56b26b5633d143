//! Scripting / data-model host interface (C2) — [MODULE: datamodel].
//!
//! The core never evaluates an expression itself; it delegates through this
//! trait to a host-provided scripting engine (§6.2), generalizing the
//! teacher's `Guards` component (a static, pre-computed boolean) into a
//! dynamic evaluator the transition selector and microstep executor can call
//! at any point in a macrostep. Binding-mode initialisation (§4.8) and
//! donedata construction (§4.9) are defined purely in terms of this trait
//! plus the document model, so they live here too.

use std::fmt;

use serde_json::Value;

use crate::document::{BindingMode, ContentExpr, DataItem, Document, DoneData, StateId};

#[derive(Debug, Clone)]
pub struct DatamodelError(pub String);

impl fmt::Display for DatamodelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DatamodelError {}

impl DatamodelError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One in-process IO processor descriptor, handed to
/// [`Datamodel::setup_system_variables`] so the host can populate
/// `_ioprocessors` (W3C 5.10).
#[derive(Debug, Clone)]
pub struct IoProcessorDescriptor {
    pub name: String,
    pub location: String,
}

/// Host-provided scripting engine (§6.2). One instance is shared across all
/// sessions; each session gets its own *scripting session* keyed by
/// `session_id`, created and destroyed alongside the SCXML session itself.
pub trait Datamodel {
    fn create_session(&mut self, session_id: &str);
    fn destroy_session(&mut self, session_id: &str);
    fn evaluate_expression(&mut self, session_id: &str, expr: &str) -> Result<Value, DatamodelError>;
    fn execute_script(&mut self, session_id: &str, src: &str) -> Result<(), DatamodelError>;
    fn set_variable(&mut self, session_id: &str, name: &str, value: Value) -> Result<(), DatamodelError>;
    fn set_variable_dom(&mut self, session_id: &str, name: &str, xml_text: &str) -> Result<(), DatamodelError>;
    fn is_variable_pre_initialised(&self, session_id: &str, name: &str) -> bool;
    fn setup_system_variables(&mut self, session_id: &str, sm_name: &str, ioprocessors: &[IoProcessorDescriptor]);
}

/// The SCXML "null" datamodel (W3C B.1): every expression evaluation fails,
/// so guards without a real datamodel attached are simply never true except
/// the implicit empty-guard case; scripts and assignments succeed trivially
/// (there is nothing for them to mutate). Ships as the default so a host can
/// exercise the pure control-flow skeleton of a chart before wiring in a
/// real expression language, mirroring the teacher's pattern of shipping a
/// working default plugin rather than requiring every consumer to hand-roll
/// the common case.
#[derive(Debug, Default)]
pub struct NullDatamodel;

impl Datamodel for NullDatamodel {
    fn create_session(&mut self, _session_id: &str) {}
    fn destroy_session(&mut self, _session_id: &str) {}

    fn evaluate_expression(&mut self, _session_id: &str, expr: &str) -> Result<Value, DatamodelError> {
        Err(DatamodelError::new(format!(
            "null datamodel cannot evaluate expression '{expr}'"
        )))
    }

    fn execute_script(&mut self, _session_id: &str, _src: &str) -> Result<(), DatamodelError> {
        Ok(())
    }

    fn set_variable(&mut self, _session_id: &str, _name: &str, _value: Value) -> Result<(), DatamodelError> {
        Ok(())
    }

    fn set_variable_dom(&mut self, _session_id: &str, _name: &str, _xml_text: &str) -> Result<(), DatamodelError> {
        Ok(())
    }

    fn is_variable_pre_initialised(&self, _session_id: &str, _name: &str) -> bool {
        false
    }

    fn setup_system_variables(&mut self, _session_id: &str, _sm_name: &str, _ioprocessors: &[IoProcessorDescriptor]) {}
}

/// §4.8: initialise a single data item. A pre-initialised variable (e.g.
/// from invoke `<param>`) is never overwritten. Load/parse failures for
/// `src` raise `error.execution` (via the returned `Err`, which the caller
/// turns into an event) and leave the variable unbound.
pub fn initialize_data_item(
    model: &mut dyn Datamodel,
    session_id: &str,
    item: &DataItem,
) -> Result<(), DatamodelError> {
    if model.is_variable_pre_initialised(session_id, &item.id) {
        return Ok(());
    }

    if let Some(expr) = &item.expr {
        let value = model.evaluate_expression(session_id, expr)?;
        return model.set_variable(session_id, &item.id, value);
    }

    if let Some(src) = &item.src {
        return load_src(model, session_id, &item.id, src);
    }

    if let Some(content) = &item.content {
        return bind_inline_content(model, session_id, &item.id, content);
    }

    // No expr/src/content: an unbound/undefined variable. `Value::Null`
    // stands in for "unbound" since this trait has no separate undefined
    // sentinel distinct from JSON null.
    model.set_variable(session_id, &item.id, Value::Null)
}

/// `src` handling (§4.8): the document model is read-only and out of scope
/// here, so loading file content relative to the document's location is a
/// host concern expressed as `src` already holding the loaded text — this
/// core only decides how to *bind* that text once loaded. When the host
/// cannot resolve `src` at all, it should surface that as an expression
/// evaluation error through the same path as a parse failure.
fn load_src(model: &mut dyn Datamodel, session_id: &str, name: &str, src: &str) -> Result<(), DatamodelError> {
    bind_inline_content(model, session_id, name, src)
}

fn bind_inline_content(model: &mut dyn Datamodel, session_id: &str, name: &str, content: &str) -> Result<(), DatamodelError> {
    let trimmed = content.trim();
    if trimmed.starts_with('<') {
        return model.set_variable_dom(session_id, name, content);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => model.set_variable(session_id, name, value),
        Err(_) => {
            let normalized: String = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
            model.set_variable(session_id, name, Value::String(normalized))
        }
    }
}

/// §4.8 early binding: walk every data item in the document (top-level and
/// per-state) at load time, in document order.
pub fn initialize_all_early(
    model: &mut dyn Datamodel,
    session_id: &str,
    doc: &Document,
) -> Result<(), DatamodelError> {
    debug_assert_eq!(doc.get_binding_mode(), BindingMode::Early);
    for state in doc.get_all_states() {
        for item in &state.datamodel {
            initialize_data_item(model, session_id, item)?;
        }
    }
    Ok(())
}

/// §4.8 late binding: on first entry to `state_id`, assign its data items
/// (the caller is responsible for tracking "first entry" and calling this
/// exactly once per state per session lifetime).
pub fn initialize_late_on_entry(
    model: &mut dyn Datamodel,
    session_id: &str,
    doc: &Document,
    state_id: StateId,
) -> Result<(), DatamodelError> {
    for item in &doc.state(state_id).datamodel {
        initialize_data_item(model, session_id, item)?;
    }
    Ok(())
}

/// Outcome of building `done.state.X`'s `_event.data` (§4.9). The structural
/// "empty `<param location>`" error suppresses the event entirely; every
/// other path still emits it (with whatever data could be built).
pub enum DoneDataOutcome {
    Emit(Value),
    Suppress,
}

/// §4.9: build the payload for `done.state.X` / `done.invoke.Y` from a
/// `<final>` state's `donedata`. Content-expr failure emits the event with
/// empty data (never the literal expression text); an empty-`location`
/// param is a structural error that suppresses the event outright; a
/// failing per-param expression drops that one param and continues.
///
/// Returns the built value plus the list of `error.execution` messages that
/// should be raised as a side effect (the caller owns the event queue).
pub fn build_donedata(
    model: &mut dyn Datamodel,
    session_id: &str,
    donedata: Option<&DoneData>,
) -> (DoneDataOutcome, Vec<String>) {
    let mut errors = Vec::new();
    let Some(donedata) = donedata else {
        return (DoneDataOutcome::Emit(Value::Null), errors);
    };

    if let Some(content) = &donedata.content {
        return (
            DoneDataOutcome::Emit(evaluate_content(model, session_id, content, &mut errors)),
            errors,
        );
    }

    if donedata.params.is_empty() {
        return (DoneDataOutcome::Emit(Value::Null), errors);
    }

    let mut map = serde_json::Map::new();
    for param in &donedata.params {
        if param.location.is_empty() {
            errors.push(format!("donedata param '{}' has empty location", param.name));
            return (DoneDataOutcome::Suppress, errors);
        }
        let expr = param.expr.as_deref().unwrap_or(&param.location);
        match model.evaluate_expression(session_id, expr) {
            Ok(value) => {
                map.insert(param.name.clone(), value);
            }
            Err(e) => {
                errors.push(format!("donedata param '{}' failed: {e}", param.name));
            }
        }
    }
    (DoneDataOutcome::Emit(Value::Object(map)), errors)
}

fn evaluate_content(
    model: &mut dyn Datamodel,
    session_id: &str,
    content: &ContentExpr,
    errors: &mut Vec<String>,
) -> Value {
    if let Some(expr) = &content.expr {
        match model.evaluate_expression(session_id, expr) {
            Ok(value) => return value,
            Err(e) => {
                errors.push(format!("donedata content expr failed: {e}"));
                return Value::Null;
            }
        }
    }
    if let Some(inline) = &content.inline {
        match serde_json::from_str::<Value>(inline.trim()) {
            Ok(value) => return value,
            Err(_) => return Value::String(inline.clone()),
        }
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_datamodel_fails_every_expression() {
        let mut dm = NullDatamodel;
        assert!(dm.evaluate_expression("s1", "1 + 1").is_err());
    }

    #[test]
    fn empty_location_param_suppresses_donedata() {
        let mut dm = NullDatamodel;
        let donedata = DoneData {
            content: None,
            params: vec![crate::document::Param {
                name: "x".into(),
                location: String::new(),
                expr: None,
            }],
        };
        let (outcome, errors) = build_donedata(&mut dm, "s1", Some(&donedata));
        assert!(matches!(outcome, DoneDataOutcome::Suppress));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn missing_donedata_emits_null() {
        let mut dm = NullDatamodel;
        let (outcome, errors) = build_donedata(&mut dm, "s1", None);
        assert!(matches!(outcome, DoneDataOutcome::Emit(Value::Null)));
        assert!(errors.is_empty());
    }
}
