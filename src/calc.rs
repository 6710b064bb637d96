use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// Half-away-from-zero rounding to `decimals` places.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (x * f).round() / f
}

pub fn round_money(x: f64) -> f64 {
    round_to(x, 2)
}

const MONEY_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Leave,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" | "p" => Some(Self::Present),
            "absent" | "a" => Some(Self::Absent),
            "late" | "l" => Some(Self::Late),
            "leave" | "lv" => Some(Self::Leave),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Leave => "leave",
        }
    }

    pub fn counts_as_attended(self) -> bool {
        matches!(self, Self::Present | Self::Late)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub leave: u32,
    pub total: u32,
    pub attended: u32,
    pub percentage: f64,
}

impl AttendanceTally {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Leave => self.leave += 1,
        }
        self.total += 1;
        if status.counts_as_attended() {
            self.attended += 1;
        }
    }

    pub fn merge(&mut self, other: &AttendanceTally) {
        self.present += other.present;
        self.absent += other.absent;
        self.late += other.late;
        self.leave += other.leave;
        self.total += other.total;
        self.attended += other.attended;
    }

    pub fn finish(mut self, decimals: u32) -> Self {
        self.percentage = attendance_percentage(self.attended, self.total, decimals);
        self
    }
}

pub fn tally_attendance<I>(statuses: I, decimals: u32) -> AttendanceTally
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut t = AttendanceTally::default();
    for s in statuses {
        t.add(s);
    }
    t.finish(decimals)
}

pub fn attendance_percentage(attended: u32, total: u32, decimals: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to(100.0 * attended as f64 / total as f64, decimals)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeFrequency {
    OneTime,
    Monthly,
    Annual,
}

impl FeeFrequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one_time" | "onetime" | "once" => Some(Self::OneTime),
            "monthly" => Some(Self::Monthly),
            "annual" | "yearly" => Some(Self::Annual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

pub const ONE_TIME_PERIOD: &str = "ONCE";

/// Calendar year in which the academic year containing `as_of` began.
pub fn academic_year_start(start_month: u32, as_of: (i32, u32)) -> i32 {
    let (year, month) = as_of;
    if month >= start_month {
        year
    } else {
        year - 1
    }
}

/// Billing periods that have fallen due by `as_of` (year, month).
pub fn fee_periods(freq: FeeFrequency, start_month: u32, as_of: (i32, u32)) -> Vec<String> {
    match freq {
        FeeFrequency::OneTime => vec![ONE_TIME_PERIOD.to_string()],
        FeeFrequency::Annual => vec![format!("AY{}", academic_year_start(start_month, as_of))],
        FeeFrequency::Monthly => {
            let mut out = Vec::new();
            let mut y = academic_year_start(start_month, as_of);
            let mut m = start_month;
            while (y, m) <= as_of {
                out.push(format!("{:04}-{:02}", y, m));
                m += 1;
                if m > 12 {
                    m = 1;
                    y += 1;
                }
            }
            out
        }
    }
}

pub fn period_matches(freq: FeeFrequency, period: &str) -> bool {
    match freq {
        FeeFrequency::OneTime => period == ONE_TIME_PERIOD,
        FeeFrequency::Annual => period
            .strip_prefix("AY")
            .map(|y| y.len() == 4 && y.parse::<i32>().is_ok())
            .unwrap_or(false),
        FeeFrequency::Monthly => parse_month(period).is_some(),
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeeLineError {
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("paid amount {attempted:.2} exceeds remaining balance {remaining:.2} (fee {fee:.2})")]
    ExceedsFee {
        fee: f64,
        remaining: f64,
        attempted: f64,
    },
}

/// Checks one collection line against the head amount and what was already
/// settled (paid plus discounted) for the same head and period.
pub fn check_fee_line(
    fee_amount: f64,
    already_settled: f64,
    paid: f64,
    discount: f64,
) -> Result<f64, FeeLineError> {
    if paid < 0.0 {
        return Err(FeeLineError::Negative { field: "paidAmount" });
    }
    if discount < 0.0 {
        return Err(FeeLineError::Negative { field: "discount" });
    }
    let remaining = round_money(fee_amount - already_settled);
    let attempted = round_money(paid + discount);
    if attempted > remaining + MONEY_EPSILON {
        return Err(FeeLineError::ExceedsFee {
            fee: fee_amount,
            remaining: remaining.max(0.0),
            attempted,
        });
    }
    Ok(round_money(remaining - attempted))
}

pub fn payroll_net(basic: f64, allowances: f64, deductions: f64) -> f64 {
    round_money(basic + allowances - deductions)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asset" => Some(Self::Asset),
            "liability" => Some(Self::Liability),
            "equity" => Some(Self::Equity),
            "income" => Some(Self::Income),
            "expense" => Some(Self::Expense),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Liability => "liability",
            Self::Equity => "equity",
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }

    fn debit_normal(self) -> bool {
        matches!(self, Self::Asset | Self::Expense)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debit" | "dr" => Some(Self::Debit),
            "credit" | "cr" => Some(Self::Credit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Self::Debit => Self::Credit,
            Self::Credit => Self::Debit,
        }
    }
}

/// Signed effect of one posting on the balance of an account of `kind`.
pub fn balance_effect(kind: AccountKind, direction: Direction, amount: f64) -> f64 {
    match (kind.debit_normal(), direction) {
        (true, Direction::Debit) | (false, Direction::Credit) => amount,
        _ => -amount,
    }
}

/// Running balance after each posting, starting from `opening`.
pub fn running_balances(
    kind: AccountKind,
    opening: f64,
    postings: &[(Direction, f64)],
) -> Vec<f64> {
    let mut bal = opening;
    postings
        .iter()
        .map(|(d, a)| {
            bal = round_money(bal + balance_effect(kind, *d, *a));
            bal
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockMove {
    Purchase,
    Return,
    Issue,
    Adjust,
}

impl StockMove {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "purchase" => Some(Self::Purchase),
            "return" => Some(Self::Return),
            "issue" => Some(Self::Issue),
            "adjust" => Some(Self::Adjust),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Return => "return",
            Self::Issue => "issue",
            Self::Adjust => "adjust",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StockError {
    #[error("quantity must be greater than zero")]
    NonPositive,
    #[error("adjustment must not be zero")]
    ZeroAdjust,
    #[error("insufficient stock: {on_hand} on hand, {requested} requested")]
    Insufficient { on_hand: f64, requested: f64 },
}

/// Signed change a movement makes to stock on hand.
pub fn stock_delta(kind: StockMove, quantity: f64) -> Result<f64, StockError> {
    match kind {
        StockMove::Adjust if quantity == 0.0 => Err(StockError::ZeroAdjust),
        StockMove::Adjust => Ok(quantity),
        _ if quantity <= 0.0 => Err(StockError::NonPositive),
        StockMove::Issue => Ok(-quantity),
        StockMove::Purchase | StockMove::Return => Ok(quantity),
    }
}

/// Stock on hand after the movement; never below zero.
pub fn apply_stock(on_hand: f64, kind: StockMove, quantity: f64) -> Result<f64, StockError> {
    let delta = stock_delta(kind, quantity)?;
    let after = round_to(on_hand + delta, 3);
    if after < 0.0 {
        return Err(StockError::Insufficient {
            on_hand,
            requested: -delta,
        });
    }
    Ok(after)
}

pub fn parse_month(s: &str) -> Option<(i32, u32)> {
    let (y, m) = s.trim().split_once('-')?;
    if y.len() != 4 || m.len() != 2 {
        return None;
    }
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year, month))
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// First and last day of a (year, month).
pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}
