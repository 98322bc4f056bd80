//! Fixed-width CNAB line parser. Pure: same bytes in, same
//! `TransactionRecord` or `ParseError` out, no I/O. Layout and quirks per
//! spec §4.1 — the `HHMMSS >= 24` behaviour is a documented quirk, not a bug,
//! and is preserved verbatim.

use crate::domain::{Cents, DayTime, TransactionRecord, TransactionType};
use crate::error::ParseError;
use chrono::NaiveDate;

pub const LINE_LEN: usize = 80;

const TYPE_OFFSET: usize = 0;
const DATE_OFFSET: usize = 1;
const DATE_LEN: usize = 8;
const AMOUNT_OFFSET: usize = 9;
const AMOUNT_LEN: usize = 10;
const CPF_OFFSET: usize = 19;
const CPF_LEN: usize = 11;
const CARD_OFFSET: usize = 30;
const CARD_LEN: usize = 12;
const TIME_OFFSET: usize = 42;
const TIME_LEN: usize = 6;
const STORE_OWNER_OFFSET: usize = 48;
const STORE_OWNER_LEN: usize = 14;
const STORE_NAME_OFFSET: usize = 62;
const STORE_NAME_LEN: usize = 18;

/// Parse one raw CNAB line. `index` is the zero-based line number, carried
/// into any returned error.
pub fn parse_line(line: &[u8], index: u64) -> Result<TransactionRecord, ParseError> {
    if line.len() < LINE_LEN {
        return Err(ParseError::LineTooShort { index, len: line.len() });
    }

    let transaction_type = TransactionType::from_code(line[TYPE_OFFSET])
        .ok_or(ParseError::InvalidType { index })?;

    let date_field = &line[DATE_OFFSET..DATE_OFFSET + DATE_LEN];
    let transaction_date = parse_date(date_field).ok_or(ParseError::InvalidDate { index })?;

    let amount_field = &line[AMOUNT_OFFSET..AMOUNT_OFFSET + AMOUNT_LEN];
    let amount = parse_amount(amount_field).ok_or(ParseError::InvalidAmount { index })?;

    let cpf = ascii_field(&line[CPF_OFFSET..CPF_OFFSET + CPF_LEN]);
    let card = ascii_field(&line[CARD_OFFSET..CARD_OFFSET + CARD_LEN]);

    let time_field = &line[TIME_OFFSET..TIME_OFFSET + TIME_LEN];
    let transaction_time = parse_time(time_field).ok_or(ParseError::InvalidTime { index })?;

    let store_owner = ascii_field(&line[STORE_OWNER_OFFSET..STORE_OWNER_OFFSET + STORE_OWNER_LEN])
        .trim_end()
        .to_string();
    let store_name = ascii_field(&line[STORE_NAME_OFFSET..STORE_NAME_OFFSET + STORE_NAME_LEN])
        .trim_end()
        .to_string();

    Ok(TransactionRecord {
        transaction_type,
        transaction_date,
        transaction_time,
        amount,
        cpf,
        card,
        store_owner,
        store_name,
        bank_code: transaction_type,
    })
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn all_digits(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_digit)
}

fn parse_date(field: &[u8]) -> Option<NaiveDate> {
    if !all_digits(field) {
        return None;
    }
    let s = std::str::from_utf8(field).ok()?;
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_amount(field: &[u8]) -> Option<Cents> {
    if field.len() != AMOUNT_LEN || !all_digits(field) {
        return None;
    }
    let s = std::str::from_utf8(field).ok()?;
    s.parse::<u64>().ok().map(Cents)
}

/// `HHMMSS`, all digits required. None of `h`, `m`, `s` are range-checked:
/// the parser builds a plain duration-since-midnight, so `999999` is a
/// valid (if absurd) time-of-day of just over 100 hours. This is a
/// preserved quirk (spec §4.1, §8).
fn parse_time(field: &[u8]) -> Option<DayTime> {
    if !all_digits(field) {
        return None;
    }
    let s = std::str::from_utf8(field).ok()?;
    let h: u32 = s[0..2].parse().ok()?;
    let m: u32 = s[2..4].parse().ok()?;
    let sec: u32 = s[4..6].parse().ok()?;
    Some(DayTime::from_hms(h, m, sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_line(type_code: u8) -> Vec<u8> {
        let mut line = vec![b' '; LINE_LEN];
        line[0] = type_code;
        line[1..9].copy_from_slice(b"20190301");
        line[9..19].copy_from_slice(b"0000014200");
        line[19..30].copy_from_slice(b"09620676017");
        line[30..42].copy_from_slice(b"1234****7890");
        line[42..48].copy_from_slice(b"153453");
        let owner = b"JOAO MACEDO   ";
        line[48..62].copy_from_slice(owner);
        let name = b"BAR DO JOAO       ";
        line[62..80].copy_from_slice(name);
        line
    }

    #[test]
    fn parses_a_well_formed_line() {
        let line = sample_line(b'1');
        let record = parse_line(&line, 0).unwrap();
        assert_eq!(record.transaction_type, TransactionType::Debit);
        assert_eq!(record.transaction_date, NaiveDate::from_ymd_opt(2019, 3, 1).unwrap());
        assert_eq!(record.amount, Cents(14200));
        assert_eq!(record.cpf, "09620676017");
        assert_eq!(record.card, "1234****7890");
        assert_eq!(record.store_owner, "JOAO MACEDO");
        assert_eq!(record.store_name, "BAR DO JOAO");
        assert_eq!(record.bank_code, TransactionType::Debit);
    }

    #[test]
    fn line_of_79_bytes_fails_too_short() {
        let line = sample_line(b'1');
        let err = parse_line(&line[..79], 5).unwrap_err();
        assert_eq!(err.kind(), "line_too_short");
        assert_eq!(err.index(), 5);
    }

    #[test]
    fn line_of_exactly_80_bytes_succeeds() {
        let line = sample_line(b'1');
        assert_eq!(line.len(), 80);
        assert!(parse_line(&line, 0).is_ok());
    }

    #[test]
    fn invalid_type_byte_is_rejected() {
        let line = sample_line(b'X');
        let err = parse_line(&line, 2).unwrap_err();
        assert_eq!(err.kind(), "invalid_type");
    }

    #[test]
    fn invalid_month_and_day_are_rejected() {
        let mut line = sample_line(b'1');
        line[1..9].copy_from_slice(b"20191301");
        assert_eq!(parse_line(&line, 0).unwrap_err().kind(), "invalid_date");

        let mut line = sample_line(b'1');
        line[1..9].copy_from_slice(b"20190332");
        assert_eq!(parse_line(&line, 0).unwrap_err().kind(), "invalid_date");
    }

    #[test]
    fn amount_decodes_exactly() {
        let mut line = sample_line(b'1');
        line[9..19].copy_from_slice(b"0000000001");
        let record = parse_line(&line, 0).unwrap();
        assert_eq!(record.amount.to_string(), "0.01");

        line[9..19].copy_from_slice(b"0000014200");
        let record = parse_line(&line, 0).unwrap();
        assert_eq!(record.amount.to_string(), "142.00");
    }

    #[test]
    fn cpf_preserves_leading_zeros() {
        let line = sample_line(b'1');
        let record = parse_line(&line, 0).unwrap();
        assert_ne!(record.cpf, "9620676017");
        assert_eq!(record.cpf, "09620676017");
    }

    #[test]
    fn hhmmss_999999_parses_as_a_quirk() {
        let mut line = sample_line(b'1');
        line[42..48].copy_from_slice(b"999999");
        let record = parse_line(&line, 0).unwrap();
        // 99h59m... no, 99h 99m 99s as a raw duration, not wrapped.
        assert_eq!(record.transaction_time, DayTime::from_hms(99, 99, 99));
        assert!(record.transaction_time.0 > 24 * 3600);

        line[42..48].copy_from_slice(b"250000");
        let record = parse_line(&line, 0).unwrap();
        assert_eq!(record.transaction_time, DayTime::from_hms(25, 0, 0));
        assert_eq!(record.transaction_time.0, 25 * 3600);
    }

    #[test]
    fn non_digit_amount_is_rejected() {
        let mut line = sample_line(b'1');
        line[9..19].copy_from_slice(b"00000A4200");
        assert_eq!(parse_line(&line, 0).unwrap_err().kind(), "invalid_amount");
    }
}
