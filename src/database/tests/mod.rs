mod tests_dedupe;
