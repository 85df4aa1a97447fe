/// Every side effect and every skip has exactly one of these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    // calendars
    CreateManagedCalendar,
    SkipManagedDuplicateCalendar,
    PurgeDuplicateCalendarEvent,

    // layer sanitation
    DedupeStageUid,
    DedupeUserUid,
    PurgeNestedStageUid,
    CleanupNestedUid,
    MigrateUserUid,

    // intake
    ImportIntakeEvent,
    IntakeEventAlreadyImported,
    PurgeStrayIntakeUid,
    IntakeImportFailed,
    IntakeDeleteFailed,

    // source seeding
    SeedUserEvent,
    SkipSeedUidConflict,
    SkipNestedSourceUid,
    SkipSeedOutsideWindow,
    PropagateUserIntentFromSource,
    NormalizeTaskBlock,

    // stage mirror
    MirrorStageEvent,
    RepairStageDuplicateUid,
    SkipStageMirrorAfterDuplicate,
    MirrorWriteFailed,
    PruneStaleStageEvent,

    // planning
    SkipAiSamePayload,
    SkipAiNotConfigured,
    AiRequest,
    AiResponse,
    AiRequestFailed,
    SkipMalformedChange,
    SkipUnknownUid,
    AiChangeSkippedLocked,
    AiChangeSkippedNoIntent,
    AiChangeFieldDropped,
    AiChangeInvalidDatetime,
    AiChangeSkippedNoEffect,
    AiChangeConflict,
    AiChangeWriteFailed,
    ApplyAiChange,

    // operator actions
    UndoAiChange,
    ReinstructUserIntent,

    StoreOperationFailed,
    RunError,
}

const ALL: [AuditAction; 43] = [
    AuditAction::CreateManagedCalendar,
    AuditAction::SkipManagedDuplicateCalendar,
    AuditAction::PurgeDuplicateCalendarEvent,
    AuditAction::DedupeStageUid,
    AuditAction::DedupeUserUid,
    AuditAction::PurgeNestedStageUid,
    AuditAction::CleanupNestedUid,
    AuditAction::MigrateUserUid,
    AuditAction::ImportIntakeEvent,
    AuditAction::IntakeEventAlreadyImported,
    AuditAction::PurgeStrayIntakeUid,
    AuditAction::IntakeImportFailed,
    AuditAction::IntakeDeleteFailed,
    AuditAction::SeedUserEvent,
    AuditAction::SkipSeedUidConflict,
    AuditAction::SkipNestedSourceUid,
    AuditAction::SkipSeedOutsideWindow,
    AuditAction::PropagateUserIntentFromSource,
    AuditAction::NormalizeTaskBlock,
    AuditAction::MirrorStageEvent,
    AuditAction::RepairStageDuplicateUid,
    AuditAction::SkipStageMirrorAfterDuplicate,
    AuditAction::MirrorWriteFailed,
    AuditAction::PruneStaleStageEvent,
    AuditAction::SkipAiSamePayload,
    AuditAction::SkipAiNotConfigured,
    AuditAction::AiRequest,
    AuditAction::AiResponse,
    AuditAction::AiRequestFailed,
    AuditAction::SkipMalformedChange,
    AuditAction::SkipUnknownUid,
    AuditAction::AiChangeSkippedLocked,
    AuditAction::AiChangeSkippedNoIntent,
    AuditAction::AiChangeFieldDropped,
    AuditAction::AiChangeInvalidDatetime,
    AuditAction::AiChangeSkippedNoEffect,
    AuditAction::AiChangeConflict,
    AuditAction::AiChangeWriteFailed,
    AuditAction::ApplyAiChange,
    AuditAction::UndoAiChange,
    AuditAction::ReinstructUserIntent,
    AuditAction::StoreOperationFailed,
    AuditAction::RunError,
];

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CreateManagedCalendar => "create_managed_calendar",
            AuditAction::SkipManagedDuplicateCalendar => "skip_managed_duplicate_calendar",
            AuditAction::PurgeDuplicateCalendarEvent => "purge_duplicate_calendar_event",
            AuditAction::DedupeStageUid => "dedupe_stage_uid",
            AuditAction::DedupeUserUid => "dedupe_user_uid",
            AuditAction::PurgeNestedStageUid => "purge_nested_stage_uid",
            AuditAction::CleanupNestedUid => "cleanup_nested_uid",
            AuditAction::MigrateUserUid => "migrate_user_uid",
            AuditAction::ImportIntakeEvent => "import_intake_event",
            AuditAction::IntakeEventAlreadyImported => "intake_event_already_imported",
            AuditAction::PurgeStrayIntakeUid => "purge_stray_intake_uid",
            AuditAction::IntakeImportFailed => "intake_import_failed",
            AuditAction::IntakeDeleteFailed => "intake_delete_failed",
            AuditAction::SeedUserEvent => "seed_user_event",
            AuditAction::SkipSeedUidConflict => "skip_seed_uid_conflict",
            AuditAction::SkipNestedSourceUid => "skip_nested_source_uid",
            AuditAction::SkipSeedOutsideWindow => "skip_seed_outside_window",
            AuditAction::PropagateUserIntentFromSource => "propagate_user_intent_from_source",
            AuditAction::NormalizeTaskBlock => "normalize_task_block",
            AuditAction::MirrorStageEvent => "mirror_stage_event",
            AuditAction::RepairStageDuplicateUid => "repair_stage_duplicate_uid",
            AuditAction::SkipStageMirrorAfterDuplicate => "skip_stage_mirror_after_duplicate",
            AuditAction::MirrorWriteFailed => "mirror_write_failed",
            AuditAction::PruneStaleStageEvent => "prune_stale_stage_event",
            AuditAction::SkipAiSamePayload => "skip_ai_same_payload",
            AuditAction::SkipAiNotConfigured => "skip_ai_not_configured",
            AuditAction::AiRequest => "ai_request",
            AuditAction::AiResponse => "ai_response",
            AuditAction::AiRequestFailed => "ai_request_failed",
            AuditAction::SkipMalformedChange => "skip_malformed_change",
            AuditAction::SkipUnknownUid => "skip_unknown_uid",
            AuditAction::AiChangeSkippedLocked => "ai_change_skipped_locked",
            AuditAction::AiChangeSkippedNoIntent => "ai_change_skipped_no_intent",
            AuditAction::AiChangeFieldDropped => "ai_change_field_dropped",
            AuditAction::AiChangeInvalidDatetime => "ai_change_invalid_datetime",
            AuditAction::AiChangeSkippedNoEffect => "ai_change_skipped_no_effect",
            AuditAction::AiChangeConflict => "ai_change_conflict",
            AuditAction::AiChangeWriteFailed => "ai_change_write_failed",
            AuditAction::ApplyAiChange => "apply_ai_change",
            AuditAction::UndoAiChange => "undo_ai_change",
            AuditAction::ReinstructUserIntent => "reinstruct_user_intent",
            AuditAction::StoreOperationFailed => "store_operation_failed",
            AuditAction::RunError => "run_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ALL.into_iter().find(|action| action.as_str() == s)
    }

    /// Per-item failures; these make a run `partial`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AuditAction::IntakeImportFailed
                | AuditAction::IntakeDeleteFailed
                | AuditAction::SkipStageMirrorAfterDuplicate
                | AuditAction::MirrorWriteFailed
                | AuditAction::AiRequestFailed
                | AuditAction::AiChangeConflict
                | AuditAction::AiChangeWriteFailed
                | AuditAction::StoreOperationFailed
                | AuditAction::RunError
        )
    }

    /// Expected outcomes that left an item untouched.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            AuditAction::SkipManagedDuplicateCalendar
                | AuditAction::IntakeEventAlreadyImported
                | AuditAction::SkipSeedUidConflict
                | AuditAction::SkipNestedSourceUid
                | AuditAction::SkipSeedOutsideWindow
                | AuditAction::SkipStageMirrorAfterDuplicate
                | AuditAction::SkipAiSamePayload
                | AuditAction::SkipAiNotConfigured
                | AuditAction::SkipMalformedChange
                | AuditAction::SkipUnknownUid
                | AuditAction::AiChangeSkippedLocked
                | AuditAction::AiChangeSkippedNoIntent
                | AuditAction::AiChangeSkippedNoEffect
        )
    }

    /// UID uniqueness or change-token collisions with the store.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AuditAction::SkipSeedUidConflict
                | AuditAction::RepairStageDuplicateUid
                | AuditAction::SkipStageMirrorAfterDuplicate
                | AuditAction::AiChangeConflict
        )
    }
}
