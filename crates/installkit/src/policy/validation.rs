//! Input and rendered-output validation for config steps.

use crate::types::{InputSpec, InputType, OutputFormat};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Validate one value against its input declaration.
///
/// Returns one message per violated rule; empty means valid.
pub fn validate_input(spec: &InputSpec, value: Option<&Value>) -> Vec<String> {
    let name = &spec.name;
    let value = match value {
        None | Some(Value::Null) => {
            return if spec.required {
                vec![format!("{name} is required")]
            } else {
                Vec::new()
            };
        }
        Some(Value::String(s)) if s.is_empty() && spec.required => {
            return vec![format!("{name} is required")];
        }
        Some(value) => value,
    };

    let mut errors = Vec::new();
    match spec.input_type {
        InputType::Select => match value.as_str() {
            Some(choice) if spec.options.iter().any(|o| o == choice) => {}
            Some(choice) => errors.push(format!(
                "{name}: {choice:?} is not one of {}",
                spec.options.join(", ")
            )),
            None => errors.push(format!("{name}: expected one of {}", spec.options.join(", "))),
        },
        InputType::Number => match as_number(value) {
            Some(n) => {
                if let Some(min) = spec.min
                    && n < min
                {
                    errors.push(format!("{name}: {n} is below the minimum {min}"));
                }
                if let Some(max) = spec.max
                    && n > max
                {
                    errors.push(format!("{name}: {n} is above the maximum {max}"));
                }
            }
            None => errors.push(format!("{name}: expected a number")),
        },
        InputType::Boolean => {
            let ok = value.is_boolean() || matches!(value.as_str(), Some("true" | "false"));
            if !ok {
                errors.push(format!("{name}: expected true or false"));
            }
        }
        InputType::Text | InputType::Path | InputType::Password => match value.as_str() {
            Some(text) => check_text(spec, text, &mut errors),
            None => errors.push(format!("{name}: expected a string")),
        },
    }
    errors
}

fn check_text(spec: &InputSpec, text: &str, errors: &mut Vec<String>) {
    let name = &spec.name;
    let len = text.chars().count();
    if let Some(min) = spec.min_length
        && len < min
    {
        errors.push(format!("{name}: must be at least {min} characters"));
    }
    if let Some(max) = spec.max_length
        && len > max
    {
        errors.push(format!("{name}: must be at most {max} characters"));
    }
    if let Some(pattern) = &spec.pattern {
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) if re.is_match(text) => {}
            // Never echo password values.
            Ok(_) if spec.is_sensitive() => {
                errors.push(format!("{name}: does not match the required pattern"));
            }
            Ok(_) => errors.push(format!("{name}: {text:?} does not match {pattern}")),
            Err(e) => errors.push(format!("{name}: invalid pattern {pattern:?}: {e}")),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Validate every input using its supplied value or default.
pub fn validate_inputs(inputs: &[InputSpec]) -> Vec<String> {
    inputs
        .iter()
        .flat_map(|spec| validate_input(spec, spec.effective_value()))
        .collect()
}

/// Check rendered content against its declared format.
pub fn validate_output(content: &str, format: OutputFormat) -> Result<(), String> {
    match format {
        OutputFormat::Json => serde_json::from_str::<Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid JSON: {e}")),
        OutputFormat::Yaml => serde_yaml::from_str::<serde_yaml::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid YAML: {e}")),
        OutputFormat::Ini => validate_ini(content),
        OutputFormat::Raw => Ok(()),
    }
}

fn validate_ini(content: &str) -> Result<(), String> {
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            if line.len() < 3 || !line.ends_with(']') {
                return Err(format!("invalid INI section header on line {}", number + 1));
            }
            continue;
        }
        match line.split_once('=') {
            Some((key, _)) if !key.trim().is_empty() => {}
            _ => return Err(format!("invalid INI entry on line {}", number + 1)),
        }
    }
    Ok(())
}

/// Placeholder names (`{name}`) left in a rendered template.
pub fn find_placeholders(content: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(content) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Substitute `{name}` with each input's value in a single pass.
///
/// Strings are inserted without quotes and never re-scanned, so a value
/// containing `{other}` stays literal. Inputs with no value are left in
/// place so [`find_placeholders`] can report them.
pub fn render_template(template: &str, inputs: &[InputSpec]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let value = inputs
                .iter()
                .find(|input| input.name == caps[1])
                .and_then(InputSpec::effective_value);
            match value {
                None | Some(Value::Null) => caps[0].to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select() {
        let mut spec = InputSpec::new("driver", InputType::Select);
        spec.options = vec!["overlay2".into(), "btrfs".into()];
        assert!(validate_input(&spec, Some(&json!("btrfs"))).is_empty());
        assert_eq!(validate_input(&spec, Some(&json!("zfs"))).len(), 1);
    }

    #[test]
    fn test_number_bounds() {
        let mut spec = InputSpec::new("port", InputType::Number);
        spec.min = Some(1.0);
        spec.max = Some(65535.0);
        assert!(validate_input(&spec, Some(&json!(8080))).is_empty());
        assert!(validate_input(&spec, Some(&json!("443"))).is_empty());
        assert!(!validate_input(&spec, Some(&json!(0))).is_empty());
        assert!(!validate_input(&spec, Some(&json!(70000))).is_empty());
        assert!(!validate_input(&spec, Some(&json!("eighty"))).is_empty());
    }

    #[test]
    fn test_text_rules() {
        let mut spec = InputSpec::new("user", InputType::Text);
        spec.min_length = Some(2);
        spec.max_length = Some(8);
        spec.pattern = Some("[a-z]+".into());
        assert!(validate_input(&spec, Some(&json!("alice"))).is_empty());
        assert_eq!(validate_input(&spec, Some(&json!("a"))).len(), 1);
        assert_eq!(validate_input(&spec, Some(&json!("Alice1"))).len(), 1);

        spec.pattern = Some("[".into());
        let errors = validate_input(&spec, Some(&json!("alice")));
        assert!(errors[0].contains("invalid pattern"));
    }

    #[test]
    fn test_password_error_hides_value() {
        let mut spec = InputSpec::new("token", InputType::Password);
        spec.pattern = Some("[0-9]+".into());
        let errors = validate_input(&spec, Some(&json!("s3cret")));
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].contains("s3cret"));
    }

    #[test]
    fn test_boolean_and_required() {
        let spec = InputSpec::new("enabled", InputType::Boolean);
        assert!(validate_input(&spec, Some(&json!(true))).is_empty());
        assert!(validate_input(&spec, Some(&json!("false"))).is_empty());
        assert!(!validate_input(&spec, Some(&json!("yes"))).is_empty());
        assert!(validate_input(&spec, None).is_empty());

        let mut required = InputSpec::new("name", InputType::Text);
        required.required = true;
        assert_eq!(validate_input(&required, None), vec!["name is required"]);
        assert_eq!(validate_inputs(&[required]).len(), 1);
    }

    #[test]
    fn test_validate_output_formats() {
        assert!(validate_output(r#"{"a": 1}"#, OutputFormat::Json).is_ok());
        assert!(validate_output("{a: ", OutputFormat::Json).is_err());
        assert!(validate_output("a: 1\nb: [1, 2]\n", OutputFormat::Yaml).is_ok());
        assert!(validate_output("a: [1, 2\n", OutputFormat::Yaml).is_err());
        assert!(validate_output("[core]\nkey = value\n; note\n", OutputFormat::Ini).is_ok());
        assert!(validate_output("[core]\njust words\n", OutputFormat::Ini).is_err());
        assert!(validate_output("anything {at} all", OutputFormat::Raw).is_ok());
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let inputs = vec![
            InputSpec::new("greeting", InputType::Text).with_value(json!("hi {name}")),
            InputSpec::new("name", InputType::Text).with_value(json!("bob")),
        ];
        let rendered = render_template("{greeting}, {name}", &inputs);
        assert_eq!(rendered, "hi {name}, bob");
    }

    #[test]
    fn test_render_and_find_placeholders() {
        let inputs = vec![
            InputSpec::new("driver", InputType::Text).with_value(json!("overlay2")),
            InputSpec::new("debug", InputType::Boolean).with_value(json!(true)),
            InputSpec::new("missing", InputType::Text),
        ];
        let template = r#"{"storage-driver": "{driver}", "debug": {debug}, "x": "{missing}"}"#;
        let rendered = render_template(template, &inputs);
        assert_eq!(
            rendered,
            r#"{"storage-driver": "overlay2", "debug": true, "x": "{missing}"}"#
        );
        assert_eq!(find_placeholders(&rendered), vec!["missing"]);
        assert!(find_placeholders(r#"{"json": {"nested": 1}}"#).is_empty());
    }
}
