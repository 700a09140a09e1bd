//! Record schemas and field-level validation.
//!
//! A [`RecordSchema`] names the fields one function call must return, renders
//! the matching JSON Schema for the provider, and validates every returned
//! field on its own. A field that is missing or malformed becomes `null`;
//! the rest of the record is kept.

use crate::error::FieldError;
use crate::task::ProcessType;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Invoice and receipt numbers: letters, digits and common separators.
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 ._/#\-]{0,63}$").unwrap());

/// Expected shape of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Document number, e.g. `INV-2024-001`.
    Identifier,
    /// Free text, non-empty after trimming.
    Text,
    /// Calendar date as `YYYY-MM-DD`.
    Date,
    /// Monetary amount as a JSON number.
    Amount,
    /// `[{item_name, quantity, unit_price, amount}]`
    LineItems,
    /// `[{tax_type, tax_rate, tax_amount}]`, rate in percent.
    Taxes,
}

impl FieldKind {
    fn expected(self) -> &'static str {
        match self {
            FieldKind::Identifier | FieldKind::Text | FieldKind::Date => "string",
            FieldKind::Amount => "number",
            FieldKind::LineItems | FieldKind::Taxes => "array",
        }
    }

    fn json_schema(self, description: &str) -> Value {
        match self {
            FieldKind::Identifier | FieldKind::Text => json!({
                "type": "string",
                "description": description,
            }),
            FieldKind::Date => json!({
                "type": "string",
                "format": "date",
                "description": format!("{description} (YYYY-MM-DD)"),
            }),
            FieldKind::Amount => json!({
                "type": "number",
                "description": description,
            }),
            FieldKind::LineItems => json!({
                "type": "array",
                "description": description,
                "items": {
                    "type": "object",
                    "properties": {
                        "item_name":  { "type": "string" },
                        "quantity":   { "type": "integer" },
                        "unit_price": { "type": "number" },
                        "amount":     { "type": "number" }
                    },
                    "required": ["item_name", "quantity", "unit_price", "amount"]
                }
            }),
            FieldKind::Taxes => json!({
                "type": "array",
                "description": description,
                "items": {
                    "type": "object",
                    "properties": {
                        "tax_type":   { "type": "string" },
                        "tax_rate":   { "type": "number", "minimum": 0, "maximum": 100 },
                        "tax_amount": { "type": "number" }
                    },
                    "required": ["tax_type", "tax_rate", "tax_amount"]
                }
            }),
        }
    }
}

/// One declared field of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
}

const fn field(name: &'static str, kind: FieldKind, description: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        description,
    }
}

/// The fields and function name for one [`ProcessType`].
#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub process_type: ProcessType,
    pub function_name: &'static str,
    pub description: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn for_process(process_type: ProcessType) -> Self {
        use FieldKind::*;
        match process_type {
            ProcessType::Invoice => Self {
                process_type,
                function_name: "extract_data",
                description: "Extract the structured data of one invoice",
                fields: vec![
                    field("invoice_number", Identifier, "Invoice number as printed"),
                    field("issue_date", Date, "Date the invoice was issued"),
                    field("due_date", Date, "Payment due date"),
                    field("customer_name", Text, "Name of the billed customer"),
                    field("items", LineItems, "Invoice line items"),
                    field("subtotal", Amount, "Total before taxes"),
                    field("taxes", Taxes, "Taxes applied to the subtotal"),
                    field("total_amount", Amount, "Total amount due including taxes"),
                ],
            },
            ProcessType::Receipt => Self {
                process_type,
                function_name: "extract_data",
                description: "Extract the structured data of one receipt",
                fields: vec![
                    field("merchant_name", Text, "Name of the merchant"),
                    field("receipt_number", Identifier, "Receipt or transaction number"),
                    field("purchase_date", Date, "Date of purchase"),
                    field("items", LineItems, "Purchased items"),
                    field("total_amount", Amount, "Total amount paid"),
                ],
            },
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// JSON Schema of the function arguments.
    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.to_string(), f.kind.json_schema(f.description)))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.field_names().collect::<Vec<_>>(),
        })
    }

    /// A record with every field set to the empty marker.
    pub fn empty_record(&self) -> BTreeMap<String, Value> {
        self.field_names()
            .map(|name| (name.to_string(), Value::Null))
            .collect()
    }

    /// Validate each declared field of `arguments` independently.
    ///
    /// The returned map always holds every declared field. Fields that are
    /// absent or malformed are `null` and reported in the error list; fields
    /// the schema does not declare are dropped.
    pub fn validate(&self, arguments: &Value) -> (BTreeMap<String, Value>, Vec<FieldError>) {
        let object = arguments.as_object();
        let mut record = BTreeMap::new();
        let mut errors = Vec::new();

        for spec in &self.fields {
            let raw = object.and_then(|o| o.get(spec.name));
            let value = match validate_field(spec, raw) {
                Ok(v) => v,
                Err(e) => {
                    errors.push(e);
                    Value::Null
                }
            };
            record.insert(spec.name.to_string(), value);
        }
        (record, errors)
    }
}

/// Validate one field. `Ok` holds the normalised value.
pub fn validate_field(spec: &FieldSpec, raw: Option<&Value>) -> Result<Value, FieldError> {
    let name = spec.name;
    let value = match raw {
        None | Some(Value::Null) => {
            return Err(FieldError::Missing {
                field: name.to_string(),
            })
        }
        Some(v) => v,
    };
    let wrong_type = || FieldError::WrongType {
        field: name.to_string(),
        expected: spec.kind.expected(),
    };
    let bad_format = |detail: String| FieldError::BadFormat {
        field: name.to_string(),
        detail,
    };

    match spec.kind {
        FieldKind::Identifier => {
            let s = value.as_str().ok_or_else(wrong_type)?.trim();
            if IDENTIFIER_RE.is_match(s) {
                Ok(Value::String(s.to_string()))
            } else {
                Err(bad_format(format!("'{s}' is not a document number")))
            }
        }
        FieldKind::Text => {
            let s = value.as_str().ok_or_else(wrong_type)?.trim();
            if s.is_empty() {
                Err(bad_format("empty text".into()))
            } else {
                Ok(Value::String(s.to_string()))
            }
        }
        FieldKind::Date => {
            let s = value.as_str().ok_or_else(wrong_type)?.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|e| bad_format(format!("'{s}' is not a YYYY-MM-DD date: {e}")))
        }
        FieldKind::Amount => {
            let n = value.as_f64().ok_or_else(wrong_type)?;
            finite(n).map(|_| value.clone()).ok_or_else(|| bad_format("not finite".into()))
        }
        FieldKind::LineItems => {
            let items = value.as_array().ok_or_else(wrong_type)?;
            items
                .iter()
                .enumerate()
                .map(|(i, item)| line_item(item).map_err(|d| bad_format(format!("item {i}: {d}"))))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        FieldKind::Taxes => {
            let taxes = value.as_array().ok_or_else(wrong_type)?;
            taxes
                .iter()
                .enumerate()
                .map(|(i, tax)| tax_line(tax).map_err(|d| bad_format(format!("tax {i}: {d}"))))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
    }
}

fn finite(n: f64) -> Option<f64> {
    n.is_finite().then_some(n)
}

fn get_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    match obj.get(key).and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(format!("'{key}' must be a non-empty string")),
    }
}

fn get_number(obj: &Map<String, Value>, key: &str) -> Result<f64, String> {
    obj.get(key)
        .and_then(Value::as_f64)
        .and_then(finite)
        .ok_or_else(|| format!("'{key}' must be a number"))
}

/// Integers, or floats with no fractional part (`2.0`).
fn get_integer(obj: &Map<String, Value>, key: &str) -> Result<i64, String> {
    let v = obj.get(key);
    if let Some(i) = v.and_then(Value::as_i64) {
        return Ok(i);
    }
    match v.and_then(Value::as_f64) {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(format!("'{key}' must be an integer")),
    }
}

fn line_item(item: &Value) -> Result<Value, String> {
    let obj = item.as_object().ok_or("not an object")?;
    Ok(json!({
        "item_name": get_str(obj, "item_name")?,
        "quantity": get_integer(obj, "quantity")?,
        "unit_price": get_number(obj, "unit_price")?,
        "amount": get_number(obj, "amount")?,
    }))
}

fn tax_line(tax: &Value) -> Result<Value, String> {
    let obj = tax.as_object().ok_or("not an object")?;
    let rate = get_number(obj, "tax_rate")?;
    if !(0.0..=100.0).contains(&rate) {
        return Err(format!("'tax_rate' {rate} is outside 0-100"));
    }
    Ok(json!({
        "tax_type": get_str(obj, "tax_type")?,
        "tax_rate": rate,
        "tax_amount": get_number(obj, "tax_amount")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice() -> RecordSchema {
        RecordSchema::for_process(ProcessType::Invoice)
    }

    #[test]
    fn json_schema_requires_every_field() {
        let schema = invoice().json_schema();
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 8);
        assert_eq!(schema["properties"]["issue_date"]["format"], "date");
        assert_eq!(schema["properties"]["items"]["items"]["properties"]["quantity"]["type"], "integer");
    }

    #[test]
    fn valid_arguments_pass_through() {
        let args = json!({
            "invoice_number": "INV-2024-001",
            "issue_date": "2024-03-01",
            "due_date": "2024-03-31",
            "customer_name": "  Acme Corp ",
            "items": [{"item_name": "Widget", "quantity": 2, "unit_price": 10.5, "amount": 21.0}],
            "subtotal": 21.0,
            "taxes": [{"tax_type": "VAT", "tax_rate": 20, "tax_amount": 4.2}],
            "total_amount": 25.2
        });
        let (record, errors) = invoice().validate(&args);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(record["customer_name"], "Acme Corp");
        assert_eq!(record["items"][0]["quantity"], 2);
        assert_eq!(record["total_amount"], 25.2);
    }

    #[test]
    fn one_bad_field_does_not_discard_the_rest() {
        let args = json!({
            "invoice_number": "INV-7",
            "issue_date": "2024-02-30",
            "total_amount": "one hundred",
            "customer_name": "Globex",
        });
        let (record, errors) = invoice().validate(&args);
        assert_eq!(record.len(), 8);
        assert_eq!(record["invoice_number"], "INV-7");
        assert_eq!(record["customer_name"], "Globex");
        assert_eq!(record["issue_date"], Value::Null);
        assert_eq!(record["total_amount"], Value::Null);
        assert!(errors
            .iter()
            .any(|e| matches!(e, FieldError::WrongType { field, .. } if field == "total_amount")));
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let (record, _) = invoice().validate(&json!({"vendor_iban": "DE00"}));
        assert!(!record.contains_key("vendor_iban"));
        assert!(record.values().all(Value::is_null));
    }

    #[test]
    fn non_object_arguments_yield_empty_record() {
        let (record, errors) = invoice().validate(&json!(["not", "an", "object"]));
        assert_eq!(record, invoice().empty_record());
        assert_eq!(errors.len(), 8);
    }

    #[test]
    fn malformed_line_item_nulls_the_whole_list() {
        let args = json!({
            "items": [
                {"item_name": "A", "quantity": 1, "unit_price": 1.0, "amount": 1.0},
                {"item_name": "B", "quantity": 1.5, "unit_price": 1.0, "amount": 1.5}
            ]
        });
        let (record, errors) = invoice().validate(&args);
        assert_eq!(record["items"], Value::Null);
        assert!(errors
            .iter()
            .any(|e| matches!(e, FieldError::BadFormat { detail, .. } if detail.contains("item 1"))));
    }

    #[test]
    fn whole_float_quantity_is_accepted() {
        let args = json!({"items": [{"item_name": "A", "quantity": 3.0, "unit_price": 2, "amount": 6}]});
        let (record, _) = invoice().validate(&args);
        assert_eq!(record["items"][0]["quantity"], 3);
    }

    #[test]
    fn tax_rate_out_of_range_is_rejected() {
        let args = json!({"taxes": [{"tax_type": "VAT", "tax_rate": 120, "tax_amount": 1}]});
        let (record, _) = invoice().validate(&args);
        assert_eq!(record["taxes"], Value::Null);
    }

    #[test]
    fn identifier_rejects_prose() {
        let spec = &invoice().fields[0];
        assert!(validate_field(spec, Some(&json!("see attached letter, page 2!"))).is_err());
        assert!(validate_field(spec, Some(&json!("2024/INV#0042"))).is_ok());
    }

    #[test]
    fn receipt_schema_has_its_own_fields() {
        let r = RecordSchema::for_process(ProcessType::Receipt);
        let names: Vec<_> = r.field_names().collect();
        assert!(names.contains(&"merchant_name"));
        assert!(!names.contains(&"invoice_number"));
    }
}
