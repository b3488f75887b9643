use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;

/// Domain of a query. Drives cache lifetime, rate tier and prompt hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    InvoiceAnalysis,
    MarginOptimization,
    ExcelFormulas,
    FifaProjections,
    GeneralConsultation,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::InvoiceAnalysis,
        Category::MarginOptimization,
        Category::ExcelFormulas,
        Category::FifaProjections,
        Category::GeneralConsultation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::InvoiceAnalysis => "invoice_analysis",
            Category::MarginOptimization => "margin_optimization",
            Category::ExcelFormulas => "excel_formulas",
            Category::FifaProjections => "fifa_projections",
            Category::GeneralConsultation => "general_consultation",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a query. Drives the generation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Fast,
    Normal,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Fast => "fast",
            Complexity::Normal => "normal",
            Complexity::Complex => "complex",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Evaluated top to bottom; the first match wins.
const CATEGORY_RULES: &[(&str, Category)] = &[
    (
        r"factura|invoice|coupon|crv|producto|descuento",
        Category::InvoiceAnalysis,
    ),
    (
        r"margen|margin|profit|rentabilidad|ganancia",
        Category::MarginOptimization,
    ),
    (
        r"formula|excel|función|spreadsheet|hoja.+calculo",
        Category::ExcelFormulas,
    ),
    (
        r"fifa|2026|olympics|2028|evento|proyección",
        Category::FifaProjections,
    ),
];

const COMPLEXITY_SIGNALS: &str = r"excel|formula|projection|analysis";

const COMPLEX_WORDS: usize = 50;
const NORMAL_WORDS: usize = 20;

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<(Regex, Category)>,
    signals: Regex,
}

impl Classifier {
    pub fn new() -> Result<Self, regex::Error> {
        let rules = CATEGORY_RULES
            .iter()
            .map(|(pattern, category)| Ok((case_insensitive(pattern)?, *category)))
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            rules,
            signals: case_insensitive(COMPLEXITY_SIGNALS)?,
        })
    }

    /// Total: falls through to `GeneralConsultation` when nothing matches.
    pub fn classify(&self, message: &str) -> Category {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(message))
            .map(|(_, category)| *category)
            .unwrap_or(Category::GeneralConsultation)
    }

    pub fn complexity(&self, message: &str) -> Complexity {
        let words = message.split_whitespace().count();
        let has_digit = message.chars().any(|c| c.is_ascii_digit());
        let has_signal = self.signals.is_match(message);

        if words > COMPLEX_WORDS || (has_digit && has_signal) {
            Complexity::Complex
        } else if words > NORMAL_WORDS || has_signal {
            Complexity::Normal
        } else {
            Complexity::Fast
        }
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new().unwrap()
    }

    #[test]
    fn first_matching_rule_wins() {
        let c = classifier();
        assert_eq!(
            c.classify("Analyze my invoice with CRV fees"),
            Category::InvoiceAnalysis
        );
        // Matches both invoice and margin rules; invoice comes first.
        assert_eq!(
            c.classify("What margin do I keep after the coupon?"),
            Category::InvoiceAnalysis
        );
        assert_eq!(c.classify("Improve my PROFIT"), Category::MarginOptimization);
        assert_eq!(
            c.classify("Necesito una hoja de calculo"),
            Category::ExcelFormulas
        );
        assert_eq!(
            c.classify("Demand during the 2026 World Cup"),
            Category::FifaProjections
        );
        assert_eq!(c.classify("proyección de ventas"), Category::FifaProjections);
    }

    #[test]
    fn unmatched_input_is_general() {
        let c = classifier();
        assert_eq!(c.classify("hello"), Category::GeneralConsultation);
        assert_eq!(c.classify(""), Category::GeneralConsultation);
    }

    #[test]
    fn complexity_tiers() {
        let c = classifier();
        assert_eq!(c.complexity("hello there"), Complexity::Fast);
        assert_eq!(
            c.complexity("Analyze my invoice with CRV fees"),
            Complexity::Fast
        );
        assert_eq!(c.complexity("build me an excel sheet"), Complexity::Normal);
        assert_eq!(
            c.complexity("excel formula for 400 restaurants"),
            Complexity::Complex
        );

        let twenty_one = vec!["word"; 21].join(" ");
        assert_eq!(c.complexity(&twenty_one), Complexity::Normal);
        let fifty_one = vec!["word"; 51].join(" ");
        assert_eq!(c.complexity(&fifty_one), Complexity::Complex);
    }

    #[test]
    fn digits_alone_do_not_escalate() {
        let c = classifier();
        assert_eq!(c.complexity("order 42 cases"), Complexity::Fast);
    }
}
