use crate::error::{Error, Result};

/// Rejection fragments that mean "pay more and try again".
const FEE_REJECTIONS: &[&str] = &[
    "min relay fee not met",
    "mempool min fee not met",
    "insufficient fee",
];

/// Extract the required fee from a node rejection such as
/// `min relay fee not met, 110 < 141`.
pub fn parse_required_fee(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    if !FEE_REJECTIONS.iter().any(|f| lower.contains(f)) {
        return None;
    }
    let after = &message[message.find('<')? + 1..];
    let digits: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Translate a ledger rejection into a structured error.
pub fn classify_rejection(message: &str) -> Error {
    match parse_required_fee(message) {
        Some(required) => Error::FeeTooLow { required },
        None => Error::Broadcast(message.to_string()),
    }
}

/// Run `attempt` with `fee`, retrying on [`Error::FeeTooLow`] at most
/// `max_retries` times with the fee the ledger asked for.
///
/// The fee passed to a retry is never lower than the previous one.
pub fn with_fee_retry<T, F>(fee: u64, max_retries: u8, mut attempt: F) -> Result<T>
where
    F: FnMut(u64) -> Result<T>,
{
    let mut fee = fee;
    let mut retries = 0u8;
    loop {
        match attempt(fee) {
            Err(Error::FeeTooLow { required }) if retries < max_retries => {
                let next = required.max(fee);
                log::info!("fee: rejected at {fee} sat, retrying with {next} sat");
                fee = next;
                retries += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_rejections() {
        assert_eq!(
            parse_required_fee("min relay fee not met, 110 < 141"),
            Some(141)
        );
        assert_eq!(
            parse_required_fee(
                r#"sendrawtransaction RPC error: {"code":-26,"message":"min relay fee not met, 300 < 452"}"#
            ),
            Some(452)
        );
        assert_eq!(
            parse_required_fee("mempool min fee not met, 200 < 1000"),
            Some(1000)
        );
        assert_eq!(parse_required_fee("bad-txns-inputs-missingorspent"), None);
        assert_eq!(parse_required_fee("min relay fee not met"), None);
    }

    #[test]
    fn classifies_rejections() {
        assert!(matches!(
            classify_rejection("min relay fee not met, 1 < 2"),
            Error::FeeTooLow { required: 2 }
        ));
        assert!(matches!(
            classify_rejection("txn-already-known"),
            Error::Broadcast(msg) if msg == "txn-already-known"
        ));
    }

    #[test]
    fn retries_once_with_corrected_fee() {
        let mut seen = Vec::new();
        let result = with_fee_retry(300, 1, |fee| {
            seen.push(fee);
            if fee < 500 {
                Err(Error::FeeTooLow { required: 500 })
            } else {
                Ok(fee)
            }
        });
        assert_eq!(result.unwrap(), 500);
        assert_eq!(seen, vec![300, 500]);
    }

    #[test]
    fn retry_is_bounded() {
        let mut calls = 0;
        let result: Result<()> = with_fee_retry(300, 1, |fee| {
            calls += 1;
            Err(Error::FeeTooLow { required: fee + 100 })
        });
        assert!(matches!(result, Err(Error::FeeTooLow { required: 500 })));
        assert_eq!(calls, 2);
    }

    #[test]
    fn retry_never_lowers_fee() {
        let mut seen = Vec::new();
        let _ = with_fee_retry(800, 1, |fee| -> Result<()> {
            seen.push(fee);
            Err(Error::FeeTooLow { required: 100 })
        });
        assert_eq!(seen, vec![800, 800]);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = with_fee_retry(300, 3, |_| {
            calls += 1;
            Err(Error::Broadcast("bad-txns-inputs-missingorspent".into()))
        });
        assert!(matches!(result, Err(Error::Broadcast(_))));
        assert_eq!(calls, 1);
    }
}
