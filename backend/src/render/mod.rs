//! Salary slip rendering.
//!
//! A slip is rendered by filling a [`SlipTemplate`] with one employee's
//! [`SlipData`] and handing the result to an external document converter
//! ([`OfficeRenderer`]). The heavy lifting happens in that external process;
//! this module scopes its lifetime, classifies its failures and normalises its
//! output so identical inputs give identical bytes.

pub mod image;
pub mod office;
pub mod template;

use async_trait::async_trait;
use common::jobs::{ErrorKind, TaskError};
use common::model::employee::EmployeeRecord;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use office::OfficeRenderer;
pub use template::SlipTemplate;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// The template cannot be filled with this data. Not retryable.
    #[error("template error: {0}")]
    Template(String),

    #[error("conversion timed out after {0:?}")]
    ConversionTimeout(Duration),

    /// The converter could not be started, exited non-zero or produced nothing.
    #[error("conversion failed: {0}")]
    ConversionCrash(String),

    /// The converter produced output that is not a readable image.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Template(_) => ErrorKind::Configuration,
            Self::ConversionTimeout(_) | Self::ConversionCrash(_) => ErrorKind::TransientExternal,
            Self::Encoding(_) => ErrorKind::PermanentExternal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<RenderError> for TaskError {
    fn from(e: RenderError) -> Self {
        TaskError::new(e.kind(), e.to_string())
    }
}

/// Values a template can reference, sorted by name so digests are stable.
pub type SlipData = BTreeMap<String, String>;

/// Collects the render data for an employee: the mapped columns plus every raw
/// cell of the row.
pub fn slip_data(employee: &EmployeeRecord) -> SlipData {
    let mut data: SlipData = employee.fields.clone();
    data.insert("name".to_string(), employee.name.clone());
    if let Some(code) = &employee.code {
        data.insert("code".to_string(), code.clone());
    }
    if let Some(phone) = &employee.phone {
        data.insert("phone".to_string(), phone.clone());
    }
    if let Some(salary) = employee.salary {
        data.insert("salary".to_string(), salary.to_string());
        data.insert("salary_formatted".to_string(), format_salary(salary));
    }
    data
}

/// `12500000` -> `12.500.000 VND`
pub fn format_salary(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{}{} VND", sign, grouped)
}

/// Cache key of a render: the template digest plus the data, line by line.
pub fn input_digest(template: &SlipTemplate, data: &SlipData) -> String {
    let mut ctx = md5::Context::new();
    ctx.consume(template.digest().as_bytes());
    for (key, value) in data {
        ctx.consume(key.as_bytes());
        ctx.consume(b"=");
        ctx.consume(value.as_bytes());
        ctx.consume(b"\n");
    }
    format!("{:x}", ctx.finalize())
}

/// Turns one employee's data into PNG bytes.
#[async_trait]
pub trait SlipRenderer: Send + Sync {
    async fn render(&self, template: &SlipTemplate, data: &SlipData) -> Result<Vec<u8>, RenderError>;
}
