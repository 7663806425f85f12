mod tests_revisions;
mod tests_tokens;
mod tests_values;
