use crate::notify::CategorySummary;

/// `Logs_{category}_{stamp}.txt`
pub fn file_name(category: &str, stamp: &str) -> String {
    format!("Logs_{category}_{stamp}.txt")
}

/// Plain-text log uploaded after each category is processed.
pub fn category_log(
    category: &str,
    datetime: &str,
    counts: &CategorySummary,
    failed: &[String],
) -> String {
    let mut log = format!(
        "{category} PDFs generated log\ndate: {datetime}\n\n\
         Total: {}\nSuccess: {}\nFailed: {}\n",
        counts.total, counts.succeeded, counts.failed
    );
    if !failed.is_empty() {
        log.push_str(&format!("Failed {category}:\n"));
        for item in failed {
            log.push_str(&format!(" - {item}\n"));
        }
    }
    log
}
