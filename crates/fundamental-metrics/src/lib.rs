//! Per-ticker metric derivations over the shared raw payloads.
//!
//! Each derivation is one independent computation producing zero or more
//! named scalar metrics. They share a common input contract and are listed
//! in [`SCALAR_DERIVATIONS`] so the orchestrator can evaluate them through
//! a single attempt-and-isolate loop; adding a metric means adding one
//! function and one registry entry. Key namespaces across derivations are
//! disjoint by construction.

use chrono::NaiveDate;
use screener_core::timeseries::trailing_monthly_returns;
use screener_core::{
    field_f64, FundamentalSnapshot, MetricValue, PricePoint, ScreenerError, SideValue,
    MOMENTUM_LOOKBACK_MONTHS, MONTHLY_RETURNS_KEY, VOLATILITY_KEY,
};
use statrs::statistics::Statistics;

/// Shared inputs for one derivation pass. Either payload may be missing
/// when its fetch failed; each derivation then fails cleanly on its own.
pub struct DerivationInput<'a> {
    pub ticker: &'a str,
    pub fundamentals: Option<&'a FundamentalSnapshot>,
    pub prices: Option<&'a [PricePoint]>,
}

impl DerivationInput<'_> {
    fn fundamentals(&self) -> Result<&FundamentalSnapshot, ScreenerError> {
        self.fundamentals.ok_or_else(|| {
            ScreenerError::InsufficientData("fundamental snapshot unavailable".to_string())
        })
    }

    fn prices(&self) -> Result<&[PricePoint], ScreenerError> {
        self.prices
            .ok_or_else(|| ScreenerError::InsufficientData("price series unavailable".to_string()))
    }
}

pub type ScalarOutputs = Vec<(String, MetricValue)>;
pub type ScalarDerivation = fn(&DerivationInput) -> Result<ScalarOutputs, ScreenerError>;

/// The scalar derivation registry, evaluated in order by the orchestrator.
pub const SCALAR_DERIVATIONS: &[(&str, ScalarDerivation)] = &[
    ("quote", derive_quote),
    ("highlights", derive_highlights),
    ("roce", derive_roce),
    ("five_year_pe", derive_five_year_average_pe),
    ("revenue_growth", derive_revenue_growth),
    ("eps_growth", derive_eps_growth),
    ("fcf_yield", derive_fcf_yield),
    ("buybacks", derive_buyback_change),
    ("insiders", derive_insider_ownership),
    ("moving_averages", derive_moving_averages),
    ("gross_profitability", derive_gross_profitability),
    ("accruals", derive_accruals),
    ("asset_growth", derive_asset_growth),
    ("total_yield", derive_total_yield),
    ("cop_at", derive_cop_at),
];

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator > 0.0 {
        Some(numerator / denominator)
    } else {
        None
    }
}

fn pct_change(current: f64, prior: f64) -> Option<f64> {
    if prior > 0.0 {
        Some((current - prior) / prior)
    } else {
        None
    }
}

fn cagr(current: f64, base: f64, years: f64) -> Option<f64> {
    if base > 0.0 && current > 0.0 {
        Some((current / base).powf(1.0 / years) - 1.0)
    } else {
        None
    }
}

fn missing(what: &str) -> ScreenerError {
    ScreenerError::InvalidData(format!("missing field: {what}"))
}

fn latest_yearly<'a>(
    snap: &'a FundamentalSnapshot,
    statement: &str,
) -> Result<&'a serde_json::Value, ScreenerError> {
    snap.yearly(statement)
        .first()
        .map(|(_, v)| *v)
        .ok_or_else(|| ScreenerError::InsufficientData(format!("no yearly {statement} entries")))
}

/// Current price from the most recent close, plus currency and sector.
pub fn derive_quote(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let prices = input.prices()?;
    let last = prices
        .last()
        .ok_or_else(|| ScreenerError::InsufficientData("empty price series".to_string()))?;

    let mut out: ScalarOutputs = vec![("Price".to_string(), last.adjusted_close.into())];
    if let Some(currency) = snap.general_str("CurrencyCode") {
        out.push(("Currency".to_string(), currency.into()));
    }
    if let Some(sector) = snap.general_str("Sector") {
        out.push(("Sector".to_string(), sector.into()));
    }
    Ok(out)
}

/// Selected provider highlight figures, passed through as-is.
pub fn derive_highlights(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;

    const FIELDS: &[(&str, &str)] = &[
        ("Market Cap", "MarketCapitalization"),
        ("EPS", "EarningsShare"),
        ("PE", "PERatio"),
        ("Dividend Yield", "DividendYield"),
        ("ROE", "ReturnOnEquityTTM"),
    ];

    let out: ScalarOutputs = FIELDS
        .iter()
        .filter_map(|(col, field)| snap.highlight(field).map(|v| (col.to_string(), v.into())))
        .collect();

    if out.is_empty() {
        return Err(ScreenerError::InvalidData(
            "no usable highlight fields".to_string(),
        ));
    }
    Ok(out)
}

/// Return on capital employed: EBIT over (total assets - current liabilities).
pub fn derive_roce(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let income = latest_yearly(snap, "Income_Statement")?;
    let balance = latest_yearly(snap, "Balance_Sheet")?;

    let ebit = field_f64(income, "ebit").ok_or_else(|| missing("ebit"))?;
    let assets = field_f64(balance, "totalAssets").ok_or_else(|| missing("totalAssets"))?;
    let current_liabilities = field_f64(balance, "totalCurrentLiabilities")
        .ok_or_else(|| missing("totalCurrentLiabilities"))?;

    let roce = ratio(ebit, assets - current_liabilities)
        .ok_or_else(|| ScreenerError::InvalidData("non-positive capital employed".to_string()))?;
    Ok(vec![("ROCE".to_string(), roce.into())])
}

/// Average P/E over the last five fiscal years, pairing reported annual EPS
/// with the closing price nearest each fiscal year end. Loss years are
/// skipped.
pub fn derive_five_year_average_pe(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let prices = input.prices()?;

    let mut ratios: Vec<f64> = Vec::new();
    for (date_str, eps) in snap.annual_eps().iter().take(5) {
        if *eps <= 0.0 {
            continue;
        }
        let Ok(fiscal_end) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        if let Some(close) = prices
            .iter()
            .rev()
            .find(|p| p.date <= fiscal_end)
            .map(|p| p.adjusted_close)
        {
            ratios.push(close / eps);
        }
    }

    if ratios.is_empty() {
        return Err(ScreenerError::InsufficientData(
            "no profitable years with matching prices".to_string(),
        ));
    }
    let avg = ratios.iter().sum::<f64>() / ratios.len() as f64;
    Ok(vec![("Avg PE 5Y".to_string(), avg.into())])
}

/// Year-over-year revenue growth plus a 3-year CAGR when history allows.
pub fn derive_revenue_growth(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let revenues: Vec<f64> = snap
        .yearly("Income_Statement")
        .iter()
        .filter_map(|(_, v)| field_f64(v, "totalRevenue"))
        .collect();

    if revenues.len() < 2 {
        return Err(ScreenerError::InsufficientData(
            "fewer than two yearly revenue figures".to_string(),
        ));
    }

    let mut out: ScalarOutputs = Vec::new();
    if let Some(growth) = pct_change(revenues[0], revenues[1]) {
        out.push(("Revenue Growth 1Y".to_string(), growth.into()));
    }
    if revenues.len() >= 4 {
        if let Some(growth) = cagr(revenues[0], revenues[3], 3.0) {
            out.push(("Revenue CAGR 3Y".to_string(), growth.into()));
        }
    }

    if out.is_empty() {
        return Err(ScreenerError::InvalidData(
            "non-positive base-year revenue".to_string(),
        ));
    }
    Ok(out)
}

/// Year-over-year EPS growth plus a 3-year CAGR from reported annual EPS.
pub fn derive_eps_growth(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let eps: Vec<f64> = snap.annual_eps().iter().map(|(_, e)| *e).collect();

    if eps.len() < 2 {
        return Err(ScreenerError::InsufficientData(
            "fewer than two annual EPS figures".to_string(),
        ));
    }

    let mut out: ScalarOutputs = Vec::new();
    if let Some(growth) = pct_change(eps[0], eps[1]) {
        out.push(("EPS Growth 1Y".to_string(), growth.into()));
    }
    if eps.len() >= 4 {
        if let Some(growth) = cagr(eps[0], eps[3], 3.0) {
            out.push(("EPS CAGR 3Y".to_string(), growth.into()));
        }
    }

    if out.is_empty() {
        return Err(ScreenerError::InvalidData(
            "non-positive base-year EPS".to_string(),
        ));
    }
    Ok(out)
}

/// Free-cash-flow yield on market cap, with year-over-year FCF growth.
pub fn derive_fcf_yield(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let cash_years = snap.yearly("Cash_Flow");

    let fcf_of = |v: &serde_json::Value| -> Option<f64> {
        let ocf = field_f64(v, "totalCashFromOperatingActivities")?;
        let capex = field_f64(v, "capitalExpenditures")?;
        Some(ocf - capex)
    };

    let latest_fcf = cash_years
        .first()
        .and_then(|(_, v)| fcf_of(v))
        .ok_or_else(|| missing("operating cash flow / capex"))?;
    let market_cap = snap
        .highlight("MarketCapitalization")
        .ok_or_else(|| missing("MarketCapitalization"))?;

    let yield_ = ratio(latest_fcf, market_cap)
        .ok_or_else(|| ScreenerError::InvalidData("non-positive market cap".to_string()))?;

    let mut out: ScalarOutputs = vec![("FCF Yield".to_string(), yield_.into())];
    if let Some(prior_fcf) = cash_years.get(1).and_then(|(_, v)| fcf_of(v)) {
        if prior_fcf != 0.0 {
            let growth = (latest_fcf - prior_fcf) / prior_fcf.abs();
            out.push(("FCF Growth 1Y".to_string(), growth.into()));
        }
    }
    Ok(out)
}

/// Net buyback rate from the change in shares outstanding: positive when
/// the share count shrank over the latest fiscal year.
pub fn derive_buyback_change(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let shares: Vec<f64> = snap
        .yearly("Balance_Sheet")
        .iter()
        .filter_map(|(_, v)| field_f64(v, "commonStockSharesOutstanding"))
        .collect();

    if shares.len() < 2 {
        return Err(ScreenerError::InsufficientData(
            "fewer than two yearly share counts".to_string(),
        ));
    }
    let change = pct_change(shares[0], shares[1])
        .ok_or_else(|| ScreenerError::InvalidData("non-positive prior share count".to_string()))?;
    Ok(vec![("Buyback Change 1Y".to_string(), (-change).into())])
}

/// Percentage of shares held by insiders.
pub fn derive_insider_ownership(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let pct = snap
        .shares_stat("PercentInsiders")
        .ok_or_else(|| missing("PercentInsiders"))?;
    Ok(vec![("Insider Ownership".to_string(), pct.into())])
}

/// Provider-computed 50 and 200 day moving averages.
pub fn derive_moving_averages(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;

    let out: ScalarOutputs = [("MA 50", "50DayMA"), ("MA 200", "200DayMA")]
        .iter()
        .filter_map(|(col, field)| snap.technical(field).map(|v| (col.to_string(), v.into())))
        .collect();

    if out.is_empty() {
        return Err(missing("50DayMA/200DayMA"));
    }
    Ok(out)
}

/// Gross profitability: gross profit scaled by total assets.
pub fn derive_gross_profitability(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let income = latest_yearly(snap, "Income_Statement")?;
    let balance = latest_yearly(snap, "Balance_Sheet")?;

    let gross_profit = field_f64(income, "grossProfit").ok_or_else(|| missing("grossProfit"))?;
    let assets = field_f64(balance, "totalAssets").ok_or_else(|| missing("totalAssets"))?;

    let gp = ratio(gross_profit, assets)
        .ok_or_else(|| ScreenerError::InvalidData("non-positive total assets".to_string()))?;
    Ok(vec![("Gross Profitability".to_string(), gp.into())])
}

/// Accrual ratio: (net income - operating cash flow) / total assets.
/// Lower is better; high accruals flag low earnings quality.
pub fn derive_accruals(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let income = latest_yearly(snap, "Income_Statement")?;
    let cash = latest_yearly(snap, "Cash_Flow")?;
    let balance = latest_yearly(snap, "Balance_Sheet")?;

    let net_income = field_f64(income, "netIncome").ok_or_else(|| missing("netIncome"))?;
    let ocf = field_f64(cash, "totalCashFromOperatingActivities")
        .ok_or_else(|| missing("totalCashFromOperatingActivities"))?;
    let assets = field_f64(balance, "totalAssets").ok_or_else(|| missing("totalAssets"))?;

    let accruals = ratio(net_income - ocf, assets)
        .ok_or_else(|| ScreenerError::InvalidData("non-positive total assets".to_string()))?;
    Ok(vec![("Accruals".to_string(), accruals.into())])
}

/// Year-over-year total asset growth. Lower is better for the
/// conservative composite.
pub fn derive_asset_growth(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let assets: Vec<f64> = snap
        .yearly("Balance_Sheet")
        .iter()
        .filter_map(|(_, v)| field_f64(v, "totalAssets"))
        .collect();

    if assets.len() < 2 {
        return Err(ScreenerError::InsufficientData(
            "fewer than two yearly asset figures".to_string(),
        ));
    }
    let growth = pct_change(assets[0], assets[1])
        .ok_or_else(|| ScreenerError::InvalidData("non-positive prior assets".to_string()))?;
    Ok(vec![("Asset Growth 1Y".to_string(), growth.into())])
}

/// Total shareholder yield: dividends plus net buybacks over market cap.
/// Both cash-flow fields are outflows (negative) when cash is returned.
pub fn derive_total_yield(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let cash = latest_yearly(snap, "Cash_Flow")?;

    let dividends = field_f64(cash, "dividendsPaid").unwrap_or(0.0);
    let buybacks = field_f64(cash, "salePurchaseOfStock").unwrap_or(0.0);
    if dividends == 0.0 && buybacks == 0.0 {
        return Err(missing("dividendsPaid/salePurchaseOfStock"));
    }

    let market_cap = snap
        .highlight("MarketCapitalization")
        .ok_or_else(|| missing("MarketCapitalization"))?;
    let total_yield = ratio(-(dividends + buybacks), market_cap)
        .ok_or_else(|| ScreenerError::InvalidData("non-positive market cap".to_string()))?;
    Ok(vec![("Total Yield".to_string(), total_yield.into())])
}

/// Cash-based operating profitability over total assets: operating income
/// plus depreciation, with the accrual gap (OCF - net income) added back.
pub fn derive_cop_at(input: &DerivationInput) -> Result<ScalarOutputs, ScreenerError> {
    let snap = input.fundamentals()?;
    let income = latest_yearly(snap, "Income_Statement")?;
    let cash = latest_yearly(snap, "Cash_Flow")?;
    let balance = latest_yearly(snap, "Balance_Sheet")?;

    let operating_income =
        field_f64(income, "operatingIncome").ok_or_else(|| missing("operatingIncome"))?;
    let net_income = field_f64(income, "netIncome").ok_or_else(|| missing("netIncome"))?;
    let depreciation = field_f64(cash, "depreciation").unwrap_or(0.0);
    let ocf = field_f64(cash, "totalCashFromOperatingActivities")
        .ok_or_else(|| missing("totalCashFromOperatingActivities"))?;
    let assets = field_f64(balance, "totalAssets").ok_or_else(|| missing("totalAssets"))?;

    let cop = operating_income + depreciation + (ocf - net_income);
    let cop_at = ratio(cop, assets)
        .ok_or_else(|| ScreenerError::InvalidData("non-positive total assets".to_string()))?;
    Ok(vec![("COP/AT".to_string(), cop_at.into())])
}

/// The non-scalar conservative bundle: annualized volatility of monthly
/// returns plus the trailing monthly return series itself, both fed to the
/// conservative composite and the factor model via the side channel.
pub fn derive_conservative(
    input: &DerivationInput,
) -> Result<Vec<(String, SideValue)>, ScreenerError> {
    let prices = input.prices()?;
    let returns = trailing_monthly_returns(prices, MOMENTUM_LOOKBACK_MONTHS);

    if returns.len() < 12 {
        return Err(ScreenerError::InsufficientData(format!(
            "only {} monthly returns",
            returns.len()
        )));
    }

    let volatility = returns.as_slice().std_dev() * 12.0_f64.sqrt();
    Ok(vec![
        (VOLATILITY_KEY.to_string(), SideValue::Scalar(volatility)),
        (MONTHLY_RETURNS_KEY.to_string(), SideValue::Series(returns)),
    ])
}
