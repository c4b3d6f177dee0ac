//! XEP-0004: Data Forms
//!
//! Just enough of the data form model to carry pubsub node configuration:
//! typed forms, fields with one or more values, and the hidden `FORM_TYPE`.
//!
//! ```xml
//! <x xmlns='jabber:x:data' type='submit'>
//!   <field var='FORM_TYPE' type='hidden'>
//!     <value>http://jabber.org/protocol/pubsub#node_config</value>
//!   </field>
//!   <field var='pubsub#access_model'><value>roster</value></field>
//! </x>
//! ```

use minidom::Element;

use crate::ns::DATA_FORMS;
use crate::XmppError;

pub const FORM_TYPE: &str = "FORM_TYPE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormType {
    Form,
    Submit,
    Cancel,
    Result,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Form => "form",
            FormType::Submit => "submit",
            FormType::Cancel => "cancel",
            FormType::Result => "result",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "form" => Some(FormType::Form),
            "submit" => Some(FormType::Submit),
            "cancel" => Some(FormType::Cancel),
            "result" => Some(FormType::Result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub var: String,
    /// Field type (`boolean`, `list-single`, `text-single`, ...).
    pub type_: Option<String>,
    pub label: Option<String>,
    pub values: Vec<String>,
    /// Allowed values for list fields.
    pub options: Vec<String>,
}

impl Field {
    pub fn new(var: &str, type_: Option<&str>) -> Self {
        Self {
            var: var.to_string(),
            type_: type_.map(str::to_string),
            label: None,
            values: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn hidden(var: &str, value: &str) -> Self {
        Self::new(var, Some("hidden")).with_value(value)
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    fn from_element(elem: &Element) -> Option<Self> {
        let var = elem.attr("var")?;
        Some(Self {
            var: var.to_string(),
            type_: elem.attr("type").map(str::to_string),
            label: elem.attr("label").map(str::to_string),
            values: elem
                .children()
                .filter(|c| c.is("value", DATA_FORMS))
                .map(|c| c.text())
                .collect(),
            options: elem
                .children()
                .filter(|c| c.is("option", DATA_FORMS))
                .filter_map(|o| o.get_child("value", DATA_FORMS).map(|v| v.text()))
                .collect(),
        })
    }

    fn to_element(&self) -> Element {
        let mut builder = Element::builder("field", DATA_FORMS).attr("var", &self.var);
        if let Some(type_) = &self.type_ {
            builder = builder.attr("type", type_);
        }
        if let Some(label) = &self.label {
            builder = builder.attr("label", label);
        }
        for option in &self.options {
            builder = builder.append(
                Element::builder("option", DATA_FORMS)
                    .append(Element::builder("value", DATA_FORMS).append(option.clone()).build())
                    .build(),
            );
        }
        for value in &self.values {
            builder = builder.append(Element::builder("value", DATA_FORMS).append(value.clone()).build());
        }
        builder.build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataForm {
    pub type_: FormType,
    pub fields: Vec<Field>,
}

impl DataForm {
    pub fn new(type_: FormType) -> Self {
        Self {
            type_,
            fields: Vec::new(),
        }
    }

    pub fn with_form_type(self, form_type: &str) -> Self {
        self.with_field(Field::hidden(FORM_TYPE, form_type))
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// The hidden `FORM_TYPE` value, if present.
    pub fn form_type(&self) -> Option<&str> {
        self.value(FORM_TYPE)
    }

    pub fn field(&self, var: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// First value of `var`.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.field(var)
            .and_then(|f| f.values.first())
            .map(String::as_str)
    }

    pub fn values(&self, var: &str) -> &[String] {
        self.field(var).map(|f| f.values.as_slice()).unwrap_or(&[])
    }

    pub fn from_element(elem: &Element) -> Result<Self, XmppError> {
        if !elem.is("x", DATA_FORMS) {
            return Err(XmppError::bad_request(Some("Expected data form".to_string())));
        }
        let type_ = elem
            .attr("type")
            .and_then(FormType::from_str)
            .ok_or_else(|| XmppError::bad_request(Some("Invalid data form type".to_string())))?;
        let fields = elem
            .children()
            .filter(|c| c.is("field", DATA_FORMS))
            .filter_map(Field::from_element)
            .collect();
        Ok(Self { type_, fields })
    }

    pub fn to_element(&self) -> Element {
        self.fields
            .iter()
            .fold(
                Element::builder("x", DATA_FORMS).attr("type", self.type_.as_str()),
                |builder, field| builder.append(field.to_element()),
            )
            .build()
    }
}

/// Parse a boolean field value (`true`/`false`/`1`/`0`).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit_form() {
        let elem: Element = "<x xmlns='jabber:x:data' type='submit'>\
            <field var='FORM_TYPE' type='hidden'><value>http://jabber.org/protocol/pubsub#node_config</value></field>\
            <field var='pubsub#access_model'><value>roster</value></field>\
            <field var='pubsub#roster_groups_allowed'><value>friends</value><value>family</value></field>\
            </x>"
            .parse()
            .unwrap();
        let form = DataForm::from_element(&elem).unwrap();
        assert_eq!(form.type_, FormType::Submit);
        assert_eq!(form.form_type(), Some("http://jabber.org/protocol/pubsub#node_config"));
        assert_eq!(form.value("pubsub#access_model"), Some("roster"));
        assert_eq!(form.values("pubsub#roster_groups_allowed").len(), 2);
        assert!(form.values("pubsub#missing").is_empty());
    }

    #[test]
    fn test_invalid_type_is_bad_request() {
        let elem: Element = "<x xmlns='jabber:x:data' type='bogus'/>".parse().unwrap();
        let err = DataForm::from_element(&elem).unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::BadRequest));
    }

    #[test]
    fn test_options_survive_serialization() {
        let form = DataForm::new(FormType::Form).with_field(
            Field::new("pubsub#notification_type", Some("list-single"))
                .with_options(["normal", "headline"])
                .with_value("headline"),
        );
        let parsed = DataForm::from_element(&form.to_element()).unwrap();
        assert_eq!(parsed, form);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }
}
