// Applied-state ledger, created at runtime by `ensure_ledger`.

diesel::table! {
    pgforge_ledger (step_id) {
        step_id -> Int4,
        description -> Text,
        applied_at -> Timestamptz,
    }
}
