use crate::classify::Category;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are the financial automation specialist for B&R Food Services, a food distributor in Los Angeles preparing for FIFA 2026 and Olympics 2028.

SPECIALIZATION:
- Automatic invoice processing with products, coupons and CRV fees
- Margin optimization for 400+ restaurants and caterers
- Excel formula creation for financial analysis
- Demand projections for massive events

INVOICE STRUCTURE:
- Products: description + base price
- Coupons: \"Coupon\" + discount (negative value)
- CRV Fees: \"CRV X.XX\" + charge (positive value)
- RULE: Adjustments always apply to the previous product

CORE EXCEL FORMULA:
=IF(OR(LEFT(LOWER(D2),3)=\"crv\", LOWER(D2)=\"coupon\"), \"\", E2 + IF(OR(LEFT(LOWER(D3),3)=\"crv\", LOWER(D3)=\"coupon\"), E3, 0))

Always respond as a food distribution expert focused on automation, efficiency and preparation for massive growth. Use emojis and markdown format for readability.";

fn category_hint(category: Category) -> Option<&'static str> {
    match category {
        Category::InvoiceAnalysis => Some(
            "Focus on identifying products, coupons and CRV fees. Provide specific Excel formulas.",
        ),
        Category::MarginOptimization => Some(
            "Analyze margins considering the foodservice industry. Include benchmarks and strategies.",
        ),
        Category::ExcelFormulas => {
            Some("Generate robust formulas and explain each component. Include validations.")
        }
        Category::FifaProjections => Some(
            "Use historical data from similar events. Consider seasonality and operational capacity.",
        ),
        Category::GeneralConsultation => None,
    }
}

/// System persona, category hint and the sanitized user message.
pub fn build(system: &str, category: Category, message: &str) -> String {
    let mut prompt = String::with_capacity(system.len() + message.len() + 256);
    prompt.push_str(system);
    if let Some(hint) = category_hint(category) {
        prompt.push_str("\n\n");
        prompt.push_str(hint);
    }
    prompt.push_str("\n\nUser: ");
    prompt.push_str(message);
    prompt.push_str("\n\nRespond as the B&R Food Services specialist:");
    prompt
}
