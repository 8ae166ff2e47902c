//! Custom property definitions and their typed value validation.
//!
//! Definitions come from an external schema; this module only knows how to check
//! a list of submitted strings against one definition.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Data kind of a property value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    String,
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Email,
    Choice,
    #[serde(alias = "model")]
    Reference,
}

/// One custom field that applies to uploads bound for certain target kinds.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PropertyDefinition {
    /// Alphanumeric key used in form fields and stored properties.
    pub slug: String,

    pub label: String,

    pub data_type: DataKind,

    #[serde(default = "default_required")]
    pub required: bool,

    /// Allowed values for `choice`, and for `reference` when non-empty.
    #[serde(default)]
    pub choices: Vec<String>,

    /// Target kinds (session `target_kind` / attachment `owner_type`) this field
    /// applies to.
    #[serde(default)]
    pub target_kinds: Vec<String>,
}

fn default_required() -> bool {
    true
}

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

impl PropertyDefinition {
    pub fn applies_to(&self, target_kind: &str) -> bool {
        self.target_kinds.iter().any(|kind| kind == target_kind)
    }

    /// Check submitted values. Blank strings count as absent.
    ///
    /// Returns one message per offending value, or a single "required" message.
    pub fn validate(&self, values: &[String]) -> Result<(), Vec<String>> {
        let present: Vec<&str> = values
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .collect();

        if present.is_empty() {
            // An unchecked checkbox submits nothing.
            if self.required && self.data_type != DataKind::Boolean {
                return Err(vec!["This field is required.".to_string()]);
            }
            return Ok(());
        }

        let errors: Vec<String> = present
            .into_iter()
            .filter_map(|value| self.check_value(value).err())
            .collect();

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn check_value(&self, value: &str) -> Result<(), String> {
        match self.data_type {
            DataKind::String | DataKind::Text => Ok(()),
            DataKind::Integer => value
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("Enter a whole number (got `{}`).", value)),
            DataKind::Decimal => Decimal::from_str(value)
                .map(|_| ())
                .map_err(|_| format!("Enter a number (got `{}`).", value)),
            DataKind::Boolean => {
                if parse_bool(value).is_some() {
                    Ok(())
                } else {
                    Err(format!("Enter true or false (got `{}`).", value))
                }
            }
            DataKind::Date => {
                if DATE_FORMATS
                    .iter()
                    .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
                {
                    Ok(())
                } else {
                    Err(format!("Enter a valid date (got `{}`).", value))
                }
            }
            DataKind::Email => {
                if is_email_like(value) {
                    Ok(())
                } else {
                    Err(format!("Enter a valid email address (got `{}`).", value))
                }
            }
            DataKind::Choice => self.check_choice(value),
            DataKind::Reference if self.choices.is_empty() => Ok(()),
            DataKind::Reference => self.check_choice(value),
        }
    }

    fn check_choice(&self, value: &str) -> Result<(), String> {
        if self.choices.iter().any(|choice| choice == value) {
            Ok(())
        } else {
            Err(format!(
                "Select a valid choice. `{}` is not one of the available choices.",
                value
            ))
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn is_email_like(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(data_type: DataKind, required: bool) -> PropertyDefinition {
        PropertyDefinition {
            slug: "field".into(),
            label: "Field".into(),
            data_type,
            required,
            choices: vec!["red".into(), "blue".into()],
            target_kinds: vec!["crm.contact".into()],
        }
    }

    fn vals(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn required_fields_reject_blank_values() {
        let prop = def(DataKind::String, true);
        assert!(prop.validate(&vals(&[])).is_err());
        assert!(prop.validate(&vals(&["  "])).is_err());
        assert!(prop.validate(&vals(&["hello"])).is_ok());
        assert!(def(DataKind::String, false).validate(&vals(&[])).is_ok());
    }

    #[test]
    fn unchecked_boolean_is_not_missing() {
        assert!(def(DataKind::Boolean, true).validate(&vals(&[])).is_ok());
        assert!(def(DataKind::Boolean, true).validate(&vals(&["on"])).is_ok());
        assert!(def(DataKind::Boolean, true).validate(&vals(&["maybe"])).is_err());
    }

    #[test]
    fn typed_values() {
        assert!(def(DataKind::Integer, true).validate(&vals(&["42"])).is_ok());
        assert!(def(DataKind::Integer, true).validate(&vals(&["4.2"])).is_err());
        assert!(def(DataKind::Decimal, true).validate(&vals(&["4.20"])).is_ok());
        assert!(def(DataKind::Decimal, true).validate(&vals(&["four"])).is_err());
        assert!(def(DataKind::Date, true).validate(&vals(&["2024-02-29"])).is_ok());
        assert!(def(DataKind::Date, true).validate(&vals(&["02/29/2024"])).is_ok());
        assert!(def(DataKind::Date, true).validate(&vals(&["2023-02-29"])).is_err());
        assert!(def(DataKind::Email, true).validate(&vals(&["a@b.org"])).is_ok());
        assert!(def(DataKind::Email, true).validate(&vals(&["a@b"])).is_err());
        assert!(def(DataKind::Choice, true).validate(&vals(&["red"])).is_ok());
        assert!(def(DataKind::Choice, true).validate(&vals(&["green"])).is_err());
    }

    #[test]
    fn every_bad_value_is_reported() {
        let errors = def(DataKind::Integer, true)
            .validate(&vals(&["1", "x", "y"]))
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn model_is_an_alias_for_reference() {
        let parsed: PropertyDefinition = serde_json::from_str(
            r#"{"slug":"dept","label":"Department","data_type":"model","target_kinds":["hr.employee"]}"#,
        )
        .unwrap();
        assert_eq!(parsed.data_type, DataKind::Reference);
        assert!(parsed.required);
        assert!(parsed.applies_to("hr.employee"));
        assert!(parsed.validate(&vals(&["anything"])).is_ok());
    }
}
