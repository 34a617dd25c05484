//! Diesel table definitions for the task store (spec.md §6 "Persisted
//! state"). Hand-maintained rather than `diesel print-schema`-generated: a
//! single file of `diesel::table!` blocks.

diesel::table! {
    tasks (task_id) {
        task_id -> Text,
        mode -> Text,
        pdf_name -> Text,
        file_hash -> Nullable<Text>,
        exam_dir_name -> Nullable<Text>,
        status -> Text,
        current_step -> Integer,
        error_message -> Nullable<Text>,
        expected_pages -> Nullable<Integer>,
        created_at -> Text,
        updated_at -> Text,
        finished_at -> Nullable<Text>,
        deleted_at -> Nullable<Text>,
    }
}

diesel::table! {
    task_steps (task_id, step_index) {
        task_id -> Text,
        step_index -> Integer,
        name -> Text,
        title -> Text,
        status -> Text,
        error -> Nullable<Text>,
        started_at -> Nullable<Text>,
        ended_at -> Nullable<Text>,
        artifact_json -> Nullable<Text>,
    }
}

diesel::table! {
    task_logs (id) {
        id -> BigInt,
        task_id -> Text,
        created_at -> Text,
        level -> Text,
        message -> Text,
    }
}

diesel::table! {
    task_events (id) {
        id -> BigInt,
        task_id -> Text,
        event_type -> Text,
        payload_json -> Text,
        created_at -> Text,
    }
}

diesel::joinable!(task_steps -> tasks (task_id));
diesel::allow_tables_to_appear_in_same_query!(tasks, task_steps, task_logs, task_events);
