//! Splits the contact e-mail into a business domain and name flags.

use crate::dataset::{Dataset, RowView};
use crate::domain::{is_commercial_provider, split_email};
use crate::error::Result;
use crate::models::{ColumnKind, ColumnSpec, EMAIL, FIRST_NAME, LAST_NAME, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

pub(crate) const DOMAIN: &str = "domain";
pub(crate) const EMAIL_VALID: &str = "email_valid";
pub(crate) const FIRST_NAME_IN_ACCOUNT: &str = "first_name_in_account";
pub(crate) const LAST_NAME_IN_ACCOUNT: &str = "last_name_in_account";

const ADDED: &[ColumnSpec] = &[
    ColumnSpec::text(DOMAIN),
    ColumnSpec::new(EMAIL_VALID, ColumnKind::Bool),
    ColumnSpec::new(FIRST_NAME_IN_ACCOUNT, ColumnKind::Bool),
    ColumnSpec::new(LAST_NAME_IN_ACCOUNT, ColumnKind::Bool),
];

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .unwrap()
});

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email.trim())
}

fn name_in_local_part(name: Option<&str>, local: &str) -> bool {
    match name {
        Some(name) => local.to_lowercase().contains(&name.to_lowercase()),
        None => false,
    }
}

/// Analysis of a single address.
#[derive(Debug, PartialEq)]
pub(crate) struct EmailAnalysis {
    pub domain: Option<String>,
    pub valid: bool,
    pub first_name_in_account: bool,
    pub last_name_in_account: bool,
}

pub(crate) fn analyze_email(
    email: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> EmailAnalysis {
    let parts = email.filter(|e| is_valid_email(e)).and_then(split_email);
    let Some((local, domain)) = parts else {
        return EmailAnalysis {
            domain: None,
            valid: false,
            first_name_in_account: false,
            last_name_in_account: false,
        };
    };
    let domain = domain.to_lowercase();
    EmailAnalysis {
        domain: (!is_commercial_provider(&domain)).then_some(domain),
        valid: true,
        first_name_in_account: name_in_local_part(first_name, local),
        last_name_in_account: name_in_local_part(last_name, local),
    }
}

#[derive(Default)]
pub(crate) struct EmailAnalyzer {
    state: StepState,
}

#[async_trait]
impl RowEnricher for EmailAnalyzer {
    fn step_name(&self) -> &'static str {
        "email_analyzer"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    async fn enrich_row(&self, row: RowView<'_>, _ctx: &StepContext) -> Result<RowValues> {
        let analysis = analyze_email(row.text(EMAIL), row.text(FIRST_NAME), row.text(LAST_NAME));
        Ok(vec![
            (DOMAIN, Value::from(analysis.domain)),
            (EMAIL_VALID, Value::Bool(analysis.valid)),
            (FIRST_NAME_IN_ACCOUNT, Value::Bool(analysis.first_name_in_account)),
            (LAST_NAME_IN_ACCOUNT, Value::Bool(analysis.last_name_in_account)),
        ])
    }
}

#[async_trait]
impl Step for EmailAnalyzer {
    fn name(&self) -> &'static str {
        "email_analyzer"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[EMAIL, FIRST_NAME, LAST_NAME]
    }

    fn added_cols(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn state(&self) -> &StepState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StepState {
        &mut self.state
    }

    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
        run_row_step(self, ctx).await
    }
}
