use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use regex::Regex;

use crate::util::condense_whitespace;

const MARKET_LINE_SCAN_LIMIT: usize = 80;
const PRICE_INTEGER_MIN: u32 = 100;
const PRICE_INTEGER_MAX: u32 = 399;

const CLASS_KEYWORDS: &[(&str, &[&str])] = &[
    ("feeder_steers", &[r"(?i)steer", r"(?i)\bstr\b"]),
    ("feeder_heifers", &[r"(?i)heifer", r"(?i)\bhfr\b"]),
    ("cows", &[r"(?i)\bcows?\b"]),
    ("bulls", &[r"(?i)\bbulls?\b"]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDraft {
    pub sale_date: NaiveDate,
    pub est_head: Option<u32>,
    pub raw_line: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassPriceSummary {
    pub label: &'static str,
    pub avg_cwt: f64,
    pub lots: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultDraft {
    pub market_line: Option<String>,
    pub sale_date: NaiveDate,
    pub total_head: Option<u32>,
    pub classes: Vec<ClassPriceSummary>,
}

#[derive(Debug)]
pub struct ReportParser {
    slash_date: Regex,
    dash_date: Regex,
    month_day_year: Regex,
    month_day: Regex,
    head_count: Regex,
    sold_head: Regex,
    total_receipts: Regex,
    market_keyword: Regex,
    price_decimal: Regex,
    price_integer: Regex,
    class_keywords: Vec<(&'static str, Vec<Regex>)>,
}

impl ReportParser {
    pub fn new() -> Result<Self> {
        let mut class_keywords = Vec::with_capacity(CLASS_KEYWORDS.len());
        for (label, patterns) in CLASS_KEYWORDS {
            let mut compiled = Vec::with_capacity(patterns.len());
            for pattern in *patterns {
                compiled.push(
                    Regex::new(pattern)
                        .with_context(|| format!("failed to compile class keyword {pattern}"))?,
                );
            }
            class_keywords.push((*label, compiled));
        }

        Ok(Self {
            slash_date: Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})")
                .context("failed to compile slash date regex")?,
            dash_date: Regex::new(r"(\d{1,2})-(\d{1,2})-(\d{4})")
                .context("failed to compile dash date regex")?,
            month_day_year: Regex::new(
                r"(?i)\b([A-Za-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})",
            )
            .context("failed to compile month-day-year regex")?,
            month_day: Regex::new(r"(?i)\b([A-Za-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?\b")
                .context("failed to compile month-day regex")?,
            head_count: Regex::new(r"(?i)(\d[\d,]*)\s*head")
                .context("failed to compile head count regex")?,
            sold_head: Regex::new(r"(?i)(?:sold|receipts|run of)\s+([\d,]+)\s+head")
                .context("failed to compile sold-head regex")?,
            total_receipts: Regex::new(r"(?i)total\s+(?:receipts|head)\s*[:\-]\s*([\d,]+)")
                .context("failed to compile total-receipts regex")?,
            market_keyword: Regex::new(r"(?i)Livestock|Auction|Exchange|Stockyards?")
                .context("failed to compile market keyword regex")?,
            price_decimal: Regex::new(r"\$?\s*([12]?\d{2}\.\d{2})\b")
                .context("failed to compile decimal price regex")?,
            price_integer: Regex::new(r"\b([12]\d{2})\b")
                .context("failed to compile integer price regex")?,
            class_keywords,
        })
    }

    pub fn parse_date(&self, text: &str, default_year: i32) -> Option<NaiveDate> {
        for captures in self.slash_date.captures_iter(text) {
            if let Some(date) = numeric_date(&captures) {
                return Some(date);
            }
        }

        for captures in self.dash_date.captures_iter(text) {
            if let Some(date) = numeric_date(&captures) {
                return Some(date);
            }
        }

        for captures in self.month_day_year.captures_iter(text) {
            let Some(month) = month_from_name(&captures[1]) else {
                continue;
            };
            let Ok(day) = captures[2].parse::<u32>() else {
                continue;
            };
            let Ok(year) = captures[3].parse::<i32>() else {
                continue;
            };
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return Some(date);
            }
        }

        for captures in self.month_day.captures_iter(text) {
            let Some(month) = month_from_name(captures.get(1)?.as_str()) else {
                continue;
            };
            let Ok(day) = captures.get(2)?.as_str().parse::<u32>() else {
                continue;
            };
            if let Some(date) = NaiveDate::from_ymd_opt(default_year, month, day) {
                return Some(date);
            }
        }

        None
    }

    pub fn parse_head_count(&self, line: &str) -> Option<u32> {
        let captures = self.head_count.captures(line)?;
        parse_grouped_integer(captures.get(1)?.as_str())
    }

    pub fn parse_total_head(&self, text: &str) -> Option<u32> {
        if let Some(captures) = self.sold_head.captures(text) {
            if let Some(value) = parse_grouped_integer(captures.get(1)?.as_str()) {
                return Some(value);
            }
        }

        let captures = self.total_receipts.captures(text)?;
        parse_grouped_integer(captures.get(1)?.as_str())
    }

    pub fn find_market_line(&self, text: &str) -> Option<String> {
        for line in text.lines().take(MARKET_LINE_SCAN_LIMIT) {
            if !self.market_keyword.is_match(line) {
                continue;
            }

            let sanitized: String = line
                .chars()
                .map(|ch| {
                    if ch.is_ascii_alphanumeric() || " ,.&'-".contains(ch) {
                        ch
                    } else {
                        ' '
                    }
                })
                .collect();
            let cleaned = condense_whitespace(&sanitized);

            if (6..=80).contains(&cleaned.len()) {
                return Some(cleaned);
            }
        }

        None
    }

    pub fn class_prices(&self, text: &str) -> Vec<ClassPriceSummary> {
        let mut summaries = Vec::new();

        for (label, keywords) in &self.class_keywords {
            let mut values = Vec::<f64>::new();

            for line in text.lines() {
                if !keywords.iter().any(|keyword| keyword.is_match(line)) {
                    continue;
                }
                values.extend(self.prices_on_line(line));
            }

            if values.is_empty() {
                continue;
            }

            let mean = values.iter().sum::<f64>() / values.len() as f64;
            summaries.push(ClassPriceSummary {
                label: *label,
                avg_cwt: (mean * 100.0).round() / 100.0,
                lots: values.len(),
            });
        }

        summaries
    }

    pub fn parse_schedule_events(&self, text: &str, default_year: i32) -> Vec<ScheduleDraft> {
        let mut events = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(sale_date) = self.parse_date(line, default_year) else {
                continue;
            };

            events.push(ScheduleDraft {
                sale_date,
                est_head: self.parse_head_count(line),
                raw_line: line.to_string(),
            });
        }

        events
    }

    pub fn parse_result_summary(&self, text: &str, default_year: i32) -> Option<ResultDraft> {
        let sale_date = self.parse_date(text, default_year)?;

        Some(ResultDraft {
            market_line: self.find_market_line(text),
            sale_date,
            total_head: self.parse_total_head(text),
            classes: self.class_prices(text),
        })
    }

    fn prices_on_line(&self, line: &str) -> Vec<f64> {
        let mut values = Vec::new();
        let mut decimal_spans = Vec::new();

        for captures in self.price_decimal.captures_iter(line) {
            if let Some(group) = captures.get(1) {
                if let Ok(value) = group.as_str().parse::<f64>() {
                    values.push(value);
                    decimal_spans.push((group.start(), group.end()));
                }
            }
        }

        for captures in self.price_integer.captures_iter(line) {
            let Some(group) = captures.get(1) else {
                continue;
            };
            // the integer part of a decimal price is not a second lot
            let overlaps_decimal = decimal_spans
                .iter()
                .any(|(start, end)| group.start() < *end && group.end() > *start);
            if overlaps_decimal {
                continue;
            }

            if let Ok(value) = group.as_str().parse::<u32>() {
                if (PRICE_INTEGER_MIN..=PRICE_INTEGER_MAX).contains(&value) {
                    values.push(f64::from(value));
                }
            }
        }

        values
    }
}

pub fn extract_pdf_pages(pdf_path: &Path, max_pages: Option<usize>) -> Result<Vec<String>> {
    let mut command = Command::new("pdftotext");
    command.arg("-enc").arg("UTF-8").arg("-f").arg("1");
    if let Some(max_pages) = max_pages {
        command.arg("-l").arg(max_pages.to_string());
    }
    command.arg(pdf_path).arg("-");

    let output = command
        .output()
        .with_context(|| format!("failed to execute pdftotext for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdftotext returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let mut pages: Vec<String> = raw
        .split('\u{000C}')
        .map(|page| page.replace('\u{0000}', ""))
        .collect();

    while let Some(last_page) = pages.last() {
        if last_page.trim().is_empty() {
            pages.pop();
            continue;
        }
        break;
    }

    Ok(pages)
}

fn numeric_date(captures: &regex::Captures<'_>) -> Option<NaiveDate> {
    let month: u32 = captures.get(1)?.as_str().parse().ok()?;
    let day: u32 = captures.get(2)?.as_str().parse().ok()?;
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_from_name(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn parse_grouped_integer(raw: &str) -> Option<u32> {
    raw.replace(',', "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ReportParser {
        ReportParser::new().unwrap()
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn parse_date_handles_numeric_forms() {
        let parser = parser();
        assert_eq!(
            parser.parse_date("Sale on 8/21/2025 at noon", 2025),
            Some(date(2025, 8, 21))
        );
        assert_eq!(
            parser.parse_date("Sale on 08-21-2025", 2025),
            Some(date(2025, 8, 21))
        );
    }

    #[test]
    fn parse_date_handles_month_name_forms() {
        let parser = parser();
        assert_eq!(
            parser.parse_date("August 21, 2025 special sale", 2024),
            Some(date(2025, 8, 21))
        );
        assert_eq!(
            parser.parse_date("Aug 21st, 2025", 2024),
            Some(date(2025, 8, 21))
        );
        assert_eq!(
            parser.parse_date("Sale Sept. 3", 2025),
            Some(date(2025, 9, 3))
        );
    }

    #[test]
    fn parse_date_skips_invalid_calendar_dates() {
        let parser = parser();
        // 13/45/2025 is not a date; the month-name fallback still fires
        assert_eq!(
            parser.parse_date("13/45/2025 then Feb 4", 2025),
            Some(date(2025, 2, 4))
        );
        assert_eq!(parser.parse_date("no dates here", 2025), None);
    }

    #[test]
    fn parse_date_ignores_bare_month_and_year() {
        let parser = parser();
        assert_eq!(parser.parse_date("report for May 2025", 2025), None);
    }

    #[test]
    fn parse_head_count_strips_thousands_separators() {
        let parser = parser();
        assert_eq!(parser.parse_head_count("expecting 1,200 head"), Some(1200));
        assert_eq!(parser.parse_head_count("350 HEAD of cattle"), Some(350));
        assert_eq!(parser.parse_head_count("no count given"), None);
    }

    #[test]
    fn parse_total_head_prefers_sold_receipts_phrase() {
        let parser = parser();
        assert_eq!(
            parser.parse_total_head("Receipts 2,340 head compared to last week"),
            Some(2340)
        );
        assert_eq!(
            parser.parse_total_head("Total Receipts: 1,805"),
            Some(1805)
        );
        assert_eq!(parser.parse_total_head("run of 410 head"), Some(410));
        assert_eq!(parser.parse_total_head("410 head"), None);
    }

    #[test]
    fn find_market_line_sanitizes_and_bounds_length() {
        let parser = parser();
        let text = "Weekly Summary\nJoplin Regional Stockyards *** (MO)\nprices follow";
        assert_eq!(
            parser.find_market_line(text).as_deref(),
            Some("Joplin Regional Stockyards MO")
        );

        let too_long = format!("Auction {}", "x".repeat(90));
        assert_eq!(parser.find_market_line(&too_long), None);
        assert_eq!(parser.find_market_line("plain text only"), None);
    }

    #[test]
    fn class_prices_average_decimal_and_integer_tokens() {
        let parser = parser();
        let text = "Feeder Steers 650-700 lbs 236.50 241.00\nSlaughter Cows 118.00\nBulls 155";
        let summaries = parser.class_prices(text);

        let steers = summaries
            .iter()
            .find(|summary| summary.label == "feeder_steers")
            .unwrap();
        assert_eq!(steers.lots, 2);
        assert_eq!(steers.avg_cwt, 238.75);

        let bulls = summaries
            .iter()
            .find(|summary| summary.label == "bulls")
            .unwrap();
        assert_eq!(bulls.lots, 1);
        assert_eq!(bulls.avg_cwt, 155.0);
    }

    #[test]
    fn class_prices_do_not_double_count_decimal_integer_parts() {
        let parser = parser();
        let summaries = parser.class_prices("steers sold at 236.50");
        let steers = summaries
            .iter()
            .find(|summary| summary.label == "feeder_steers")
            .unwrap();
        assert_eq!(steers.lots, 1);
    }

    #[test]
    fn parse_schedule_events_emits_one_event_per_dated_line() {
        let parser = parser();
        let text = "Upcoming Sales\n\nDodge City 8/26/2025 expecting 1,500 head\n\nPratt Sept 2 400 head\nno date on this line";
        let events = parser.parse_schedule_events(text, 2025);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sale_date, date(2025, 8, 26));
        assert_eq!(events[0].est_head, Some(1500));
        assert_eq!(events[1].sale_date, date(2025, 9, 2));
        assert_eq!(events[1].est_head, Some(400));
    }

    #[test]
    fn parse_result_summary_combines_market_date_and_totals() {
        let parser = parser();
        let text = "Winter Livestock Auction\nMarket Report for August 21, 2025\nReceipts 1,805 head\nFeeder Steers 238.50 242.25";
        let summary = parser.parse_result_summary(text, 2025).unwrap();

        assert_eq!(summary.market_line.as_deref(), Some("Winter Livestock Auction"));
        assert_eq!(summary.sale_date, date(2025, 8, 21));
        assert_eq!(summary.total_head, Some(1805));
        assert_eq!(summary.classes.len(), 1);
        assert_eq!(summary.classes[0].label, "feeder_steers");
    }

    #[test]
    fn parse_result_summary_requires_a_date() {
        let parser = parser();
        assert_eq!(
            parser.parse_result_summary("Joplin Stockyards, no date", 2025),
            None
        );
    }
}
